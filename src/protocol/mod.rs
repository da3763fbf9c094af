pub mod handler;
pub mod parser;

pub use handler::{handle_command, HandlerContext};
pub use parser::{Command, CommandName};
