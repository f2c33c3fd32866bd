pub mod config;
pub mod error;
pub mod ftp;
pub mod path;
pub mod session;
pub mod sftp;


pub use config::{Credentials, Destination, Protocol, TransferReceipt, TransferTask};
pub use error::TransferError;
pub use path::{dated_remote_path, normalize_destination, remote_path, split_remote_path};
pub use session::{Deadline, RemoteSession, TransferMode, push, send, send_blocking};
