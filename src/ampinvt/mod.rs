pub mod packet;
pub mod transport;
