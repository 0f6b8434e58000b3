mod process;

pub use process::ProcessToolHandler;
