//! Cluster node executable. Configuration comes as TOML through the
//! `NIMBUS_CONFIG` environment variable; unset means all defaults.
//!
//!   NIMBUS_CONFIG="udp_port = 40120" cargo run --bin nimbus_node

use std::env;

use nimbus::{logger_init, pf_error, NimbusError, NimbusNode};

use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), NimbusError> {
    logger_init();

    let config = env::var("NIMBUS_CONFIG").ok();
    let mut node = NimbusNode::new_and_setup(config.as_deref()).await?;

    let (tx_term, rx_term) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            pf_error!("cannot listen for interrupts: {}", e);
            return;
        }
        let _ = tx_term.send(true);
    });

    node.run(rx_term).await
}
