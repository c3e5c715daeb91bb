// EMTR command frame builders and response buffers

pub mod cmd_device;
pub mod cmd_socket;
