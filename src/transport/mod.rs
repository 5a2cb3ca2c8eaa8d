pub mod tcp_endpoint;
pub mod udp_endpoint;
pub mod tls;
