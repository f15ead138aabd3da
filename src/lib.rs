//! # eventsock
//!
//! Event-driven messaging over a byte stream:
//!
//! * **Framing** that turns an unstructured TCP stream into discrete packets
//! * **Named events** delivered to listeners registered with `on`
//! * **Lifecycle tracking** for clients and servers, with a single
//!   `"disconnect"` per connection and cascading server teardown
//!
//! ## Quick Start
//!
//! ```no_run
//! use eventsock::tcp::{BindOptions, Server};
//!
//! # async fn demo() -> eventsock::Result<()> {
//! let server = Server::bind("127.0.0.1", 6969, BindOptions::default()).await?;
//! server.on_connection(|conn| {
//!     let reply = conn.clone();
//!     conn.on("ping", move |_| {
//!         let _ = reply.signal("pong");
//!     });
//! });
//! server.listen()?;
//!
//! let client = eventsock::tcp::connect(server.local_addr()).await?;
//! client.on("pong", |event| println!("got {}", event.name));
//! client.start();
//! client.signal("ping")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! '-' base64( {"data": <base64 payload | null>, "metadata": {"eventType": "<name>"}} ) '.'
//! ```
//!
//! - **START** (`-`): opens a frame
//! - **BODY**: standard base64 of a JSON envelope
//! - **END** (`.`): closes the frame
//!
//! The base64 alphabet holds neither delimiter, so no escaping is needed.
//! Frames that fail to decode are dropped without affecting later frames.
//!
//! ## Events
//!
//! | Name            | Emitted by  | Payload                      |
//! |-----------------|-------------|------------------------------|
//! | any             | Connection  | packet payload               |
//! | `disconnect`    | Connection  | none, exactly once           |
//! | `connection`    | Server      | the accepted `Connection`    |
//! | `disconnection` | Server      | the departed `Connection`    |
//! | `destroy`       | Server      | none, exactly once           |
//! | `*`             | both        | every event, with its name   |
//!
//! `disconnect` and `*` are reserved: packets from a peer using them are
//! dropped.

pub mod codec;
pub mod emitter;
pub mod frame;
pub mod reassembly;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use types::{
    is_reserved_event, ConnectionId, EventSockError, MalformedFrame, Packet, Payload, Result,
    CONNECTION_EVENT, DESTROY_EVENT, DISCONNECTION_EVENT, DISCONNECT_EVENT, FRAME_END,
    FRAME_START, WILDCARD_EVENT,
};

pub use codec::EventCodec;
pub use emitter::{Event, EventEmitter, ListenerId};
pub use frame::{decode_frame, encode_frame};
pub use reassembly::StreamReassembler;
pub use tcp::{connect, Connection, Server, ServerEvent};
