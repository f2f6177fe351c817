//! SMS handling on top of the command engine: `+CMGR` decoding, duplicate
//! suppression and the outgoing send queue.
pub mod codec;
pub mod dedup;
pub mod sender;
