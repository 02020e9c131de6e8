//! Cluster object-store client
//!
//! The narrow get/list/create/update/delete surface the devbox controller
//! needs from the Kubernetes API, behind a trait so reconciliation logic can
//! be exercised against an in-memory store.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?);
//!
//! if let Some(devbox) = client.get_devbox("tenant-a", "my-box").await? {
//!     println!("{:?}", devbox.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{KubeClusterClient, creation_time, label_selector};
pub use cluster_trait::{ClusterClientTrait, Labels};
pub use error::ClusterError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
