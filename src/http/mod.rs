pub mod client;
pub mod parser;
pub mod server;

pub use client::{ByteRange, Client, Response};
pub use parser::{Flags, Method, Parser, ParserType, Range};
pub use server::{Handler, Request, Server};
