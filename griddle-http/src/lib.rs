pub mod dto;
pub mod handlers;
pub mod server;

pub use server::{internal_router, public_router, serve};
