pub mod cmd_helper;
pub mod fs;
