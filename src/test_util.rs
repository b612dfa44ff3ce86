use std::time::Duration;

use crate::domo::domo_config::DomoConfig;
use crate::transport::socket::{Socket, SocketFamily};

/// convenience config for unit test code: heartbeat timings tightened so
///  liveness and expiry tests run in milliseconds instead of seconds
pub fn fast_config() -> DomoConfig {
    DomoConfig {
        heartbeat_interval: Duration::from_millis(40),
        heartbeat_liveness: 3,
        reconnect_delay: Duration::from_millis(10),
    }
}

/// a broker-side socket bound to an ephemeral port, plus the address peers
///  can connect to
pub async fn bound_router() -> (Socket, String) {
    let mut socket = Socket::new(SocketFamily::Router);
    let addr = socket.bind("127.0.0.1:0").await.unwrap();
    (socket, addr.to_string())
}

pub async fn connected_dealer(addr: &str) -> Socket {
    let mut socket = Socket::new(SocketFamily::Dealer);
    socket.connect(addr).await.unwrap();
    socket
}
