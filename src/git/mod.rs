pub mod repository;
pub mod transport;

pub use repository::GitRepository;
pub use transport::{GitTransport, HttpCredentials};
