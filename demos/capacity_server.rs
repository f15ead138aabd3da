use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsock::tcp::{BindOptions, Connection, Server};
use tracing::info;

/// Clients allowed to join at once.
const CAPACITY: usize = 3;
/// Clients that stay silent this long are dropped.
const INACTIVITY_WINDOW: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting eventsock capacity server example...");

    let server = Server::bind("127.0.0.1", 6969, BindOptions::default()).await?;
    let joined = Arc::new(AtomicUsize::new(0));

    server.on_connection(move |conn| handle_connection(conn, Arc::clone(&joined)));
    server.on_disconnection(|conn| {
        info!("Client {} left ({:?})", conn.id(), conn.peer_addr());
    });
    server.listen()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.destroy().await;

    Ok(())
}

fn handle_connection(conn: &Connection, joined: Arc<AtomicUsize>) {
    info!("Client {} connected from {:?}", conn.id(), conn.peer_addr());

    let active = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&active);
    conn.on("*", move |_| seen.store(true, Ordering::SeqCst));

    let was_member = Arc::new(AtomicBool::new(false));
    let member = Arc::clone(&was_member);
    let reply = conn.clone();
    let count = Arc::clone(&joined);
    conn.on("join", move |_| {
        if member.load(Ordering::SeqCst) {
            return;
        }
        if count.fetch_add(1, Ordering::SeqCst) < CAPACITY {
            member.store(true, Ordering::SeqCst);
            info!("Client {} joined", reply.id());
            let _ = reply.signal("ok");
        } else {
            count.fetch_sub(1, Ordering::SeqCst);
            info!("Client {} rejected, server full", reply.id());
            let _ = reply.signal("full");
            reply.destroy();
        }
    });

    conn.on_disconnect(move || {
        if was_member.load(Ordering::SeqCst) {
            joined.fetch_sub(1, Ordering::SeqCst);
        }
    });

    let conn = conn.clone();
    tokio::spawn(async move {
        tokio::time::sleep(INACTIVITY_WINDOW).await;
        if !active.load(Ordering::SeqCst) && !conn.is_closed() {
            info!("Client {} inactive, disconnecting", conn.id());
            let _ = conn.signal("inactive");
            conn.destroy();
        }
    });
}
