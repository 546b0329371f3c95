pub mod codec;
pub mod conflict;
pub mod server;

pub use server::ServerDeclaration;
