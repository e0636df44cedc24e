//! Clients used by the controllers.
//!
//! ## Architecture
//!
//! - `datagrid`: the `DataGridClient` and `DataGridConnector` seams and their error type
//! - `http`: REST v2 implementation of the data grid client
//! - `events`: server-sent event framing for the configuration listener
//! - `credentials`: identities documents stored in cluster secrets
//! - `store`: the `ResourceStore` seam over the Kubernetes API
//!
//! ## Example
//!
//! ```rust,ignore
//! use datagrid_operator::client::{DataGridConnector, Endpoint};
//!
//! let client = connector.connect(&cluster, Endpoint::Service).await?;
//! if !client.cache_exists("sessions").await? {
//!     client.create_cache_from_template("sessions", "org.infinispan.DIST_SYNC").await?;
//! }
//! ```

pub mod credentials;
pub mod datagrid;
pub mod events;
pub mod http;
pub mod store;

pub use credentials::{Identities, OPERATOR_USER};
pub use datagrid::{
    ConfigEvent, ConfigEventKind, DataGridClient, DataGridConnector, DataGridError, Endpoint,
    MediaType,
};
pub use events::EventStreamParser;
pub use http::{DataGridClientConfig, HttpConnector, HttpDataGridClient};
pub use store::{KubeStore, ResourceStore};
