//! MarketBridge gateway: WebSocket fan-out over a single brokerage session.
//!
//! ## Architecture
//!
//! ```text
//! WS client ──► hub ──► subscriptions/orders ──► upstream session ──► brokerage
//!                                                    ▲
//!                                                    │
//! WS client ◄── hub ◄── event router ◄───────────────┘  (inbound events)
//! ```
//!
//! Each component owns its state: the hub owns client sessions and their
//! outbound queues, the subscription manager owns subscription records and is
//! the single writer to the routing tables' subscription maps, the order
//! manager owns order records. The event router is the sole consumer of the
//! session's event stream. The supervisor wires everything up in dependency
//! order and tears it down in reverse.

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod orders;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod subscriptions;
pub mod supervisor;

pub use client::{ClientRegistry, ClientState, QueueClosed};
pub use config::{Config, ConfigError};
pub use error::CommandError;
pub use hub::{create_router, HubState};
pub use orders::{Order, OrderManager, OrderState};
pub use protocol::{ClientCommand, ConnectionStatus, ServerMessage};
pub use router::EventRouter;
pub use routing::RoutingTables;
pub use subscriptions::{Subscription, SubscriptionManager, SubscriptionState};
pub use supervisor::ExitReason;
