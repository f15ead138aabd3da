//! End-to-end tests over loopback TCP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsock::tcp::{connect, BindOptions, Connection, Server};
use eventsock::{DISCONNECT_EVENT, DISCONNECTION_EVENT};
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn local_server() -> Server {
    Server::bind("127.0.0.1", 0, BindOptions::default())
        .await
        .expect("bind")
}

/// Collects every event name a client sees, disconnect included.
async fn client(server: &Server) -> (Connection, mpsc::UnboundedReceiver<String>) {
    let conn = connect(server.local_addr()).await.expect("connect");
    let (tx, rx) = mpsc::unbounded_channel();
    conn.on("*", move |e| {
        let _ = tx.send(e.name.to_string());
    });
    conn.start();
    (conn, rx)
}

fn connection_counter(server: &Server) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.on_connection(move |_| {
        let _ = tx.send(());
    });
    rx
}

#[tokio::test]
async fn test_client_set_tracks_disconnects() {
    let server = local_server().await;
    let mut accepted = connection_counter(&server);
    let (gone_tx, mut gone) = mpsc::unbounded_channel();
    server.on(DISCONNECTION_EVENT, move |_| {
        let _ = gone_tx.send(());
    });
    server.listen().unwrap();

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(client(&server).await);
        next(&mut accepted).await;
    }
    assert_eq!(server.client_count(), 5);

    for (conn, _) in clients.iter().take(2) {
        conn.destroy();
    }
    next(&mut gone).await;
    next(&mut gone).await;
    assert_eq!(server.client_count(), 3);

    server.destroy().await;
    assert_eq!(server.client_count(), 0);

    for (_, events) in clients.iter_mut().skip(2) {
        assert_eq!(next(events).await, DISCONNECT_EVENT);
    }
}

/// Capacity 3: the fourth joiner gets "full" and is dropped.
#[tokio::test]
async fn test_capacity_limit() {
    const CAPACITY: usize = 3;

    let server = local_server().await;
    let joined = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&joined);
    server.on_connection(move |conn| {
        let reply = conn.clone();
        let counter = Arc::clone(&counter);
        conn.on("join", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < CAPACITY {
                let _ = reply.signal("ok");
            } else {
                counter.fetch_sub(1, Ordering::SeqCst);
                let _ = reply.signal("full");
                reply.destroy();
            }
        });
    });
    server.listen().unwrap();

    let mut clients = Vec::new();
    for _ in 0..CAPACITY {
        let (conn, mut events) = client(&server).await;
        conn.signal("join").unwrap();
        assert_eq!(next(&mut events).await, "ok");
        clients.push((conn, events));
    }

    let (late, mut events) = client(&server).await;
    late.signal("join").unwrap();
    assert_eq!(next(&mut events).await, "full");
    assert_eq!(next(&mut events).await, DISCONNECT_EVENT);
    assert!(late.is_closed());

    assert_eq!(joined.load(Ordering::SeqCst), CAPACITY);
    server.destroy().await;
}

/// A client that stays silent past the window is told so and dropped.
#[tokio::test]
async fn test_inactive_client_is_dropped() {
    let window = Duration::from_millis(100);

    let server = local_server().await;
    server.on_connection(move |conn| {
        let active = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&active);
        conn.on("*", move |_| seen.store(true, Ordering::SeqCst));

        let conn = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if !active.load(Ordering::SeqCst) {
                let _ = conn.signal("inactive");
                conn.destroy();
            }
        });
    });
    server.listen().unwrap();

    let (idle, mut idle_events) = client(&server).await;
    let (busy, mut busy_events) = client(&server).await;
    busy.signal("hello").unwrap();

    assert_eq!(next(&mut idle_events).await, "inactive");
    assert_eq!(next(&mut idle_events).await, DISCONNECT_EVENT);
    assert!(idle.is_closed());

    tokio::time::sleep(window * 2).await;
    assert!(!busy.is_closed());
    assert!(busy_events.try_recv().is_err());
    assert_eq!(server.client_count(), 1);

    server.destroy().await;
}

#[tokio::test]
async fn test_payloads_cross_the_wire() {
    let server = local_server().await;
    server.on_connection(|conn| {
        let echo = conn.clone();
        conn.on("*", move |e| {
            if e.name != DISCONNECT_EVENT {
                let _ = echo.send(e.name, e.payload.as_deref());
            }
        });
    });
    server.listen().unwrap();

    let conn = connect(server.local_addr()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.on("blob", move |e| {
        let _ = tx.send(e.payload.clone());
    });
    conn.start();

    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    conn.send("blob", Some(&big)).unwrap();
    conn.send("blob", None).unwrap();

    assert_eq!(next(&mut rx).await.as_deref(), Some(&big[..]));
    assert_eq!(next(&mut rx).await, None);

    server.destroy().await;
}

#[tokio::test]
async fn test_server_destroy_disconnects_once() {
    let server = local_server().await;
    let mut accepted = connection_counter(&server);
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disconnects);
    server.on_connection(move |conn| {
        let d = Arc::clone(&d);
        conn.on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
    });
    server.listen().unwrap();

    let (_conn, mut events) = client(&server).await;
    next(&mut accepted).await;

    server.destroy().await;
    server.destroy().await;
    assert_eq!(next(&mut events).await, DISCONNECT_EVENT);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

/// Clients closing on their own while the server is being destroyed still
/// leave the set exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_while_clients_close() {
    const CLIENTS: usize = 6;

    let server = local_server().await;
    let mut accepted = connection_counter(&server);
    let (gone_tx, mut gone) = mpsc::unbounded_channel();
    server.on_disconnection(move |conn| {
        let _ = gone_tx.send(conn.id());
    });
    server.listen().unwrap();

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(client(&server).await);
        next(&mut accepted).await;
    }
    let accepted_side = server.clients();
    assert_eq!(accepted_side.len(), CLIENTS);

    // Peers close a third, the server side closes another third, and the
    // server is destroyed while all of that is in flight.
    for (conn, _) in clients.iter().take(CLIENTS / 3) {
        conn.destroy();
    }
    for conn in accepted_side.iter().skip(CLIENTS / 3).take(CLIENTS / 3) {
        let conn = conn.clone();
        tokio::spawn(async move { conn.destroy() });
    }
    timeout(Duration::from_secs(5), server.destroy())
        .await
        .expect("destroy did not finish");

    assert_eq!(server.client_count(), 0);
    let mut seen = HashMap::new();
    while let Ok(id) = gone.try_recv() {
        *seen.entry(id).or_insert(0) += 1;
    }
    assert_eq!(seen.len(), CLIENTS);
    assert!(seen.values().all(|&n| n == 1));
    for conn in &accepted_side {
        assert!(seen.contains_key(&conn.id()));
    }

    for (_, events) in clients.iter_mut() {
        assert_eq!(next(events).await, DISCONNECT_EVENT);
    }
}
