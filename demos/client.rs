use std::error::Error;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting eventsock client example...");

    let client = eventsock::tcp::connect("127.0.0.1:6969").await?;

    client.on("*", |event| {
        info!("Server sent: {}", event.name);
    });

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    client.on_disconnect(move || {
        if let Some(tx) = done_tx.lock().take() {
            let _ = tx.send(());
        }
    });
    client.start();

    info!("Sending join...");
    client.signal("join")?;

    // Wait until the server drops us, or Ctrl-C
    tokio::select! {
        _ = done_rx => info!("Disconnected by server"),
        _ = tokio::signal::ctrl_c() => {
            info!("Closing connection...");
            client.destroy();
        }
    }

    info!("Client example completed");
    Ok(())
}
