//! Client for sending inference queries to an external machine-learning service.
//!
//! A host application builds a transport backend ([`HttpBackend`] or [`OscBackend`])
//! with the [`Callbacks`] it cares about, then sends images or JSON payloads through
//! the [`InferenceBackend`] trait. Results arrive asynchronously as
//! [`InferenceEvent`]s delivered by a [`DispatchBridge`]:
//!
//! - callbacks the host never registered are skipped silently;
//! - a callback that fails or panics is disabled after its first failure;
//! - transport failures become error events instead of returned errors.
//!
//! ```no_run
//! use infernum_client::{Callbacks, ClientConfig, HttpBackend, InferenceBackend, RawImage};
//!
//! let callbacks = Callbacks::new()
//!     .on_data(|data| {
//!         println!("result: {data}");
//!         Ok(())
//!     })
//!     .on_error(|message| {
//!         eprintln!("error: {message}");
//!         Ok(())
//!     });
//!
//! let backend = HttpBackend::new(&ClientConfig::new(8000), callbacks)?;
//!
//! let pixels = vec![0u8; 256 * 256 * 3];
//! backend.query_image(&RawImage::rgb(&pixels, 256, 256));
//! # Ok::<(), infernum_client::ClientError>(())
//! ```

pub mod address;
pub mod callbacks;
pub mod config;
pub mod dispatch;
mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod osc;
pub mod query;

pub use address::{DEFAULT_HOST, Endpoint, HostAddress, validate};
pub use callbacks::{CallbackRegistry, Callbacks, SlotKind, SlotState};
pub use config::ClientConfig;
pub use dispatch::{DispatchBridge, InferenceEvent};
pub use error::{CallbackError, CallbackResult, ClientError};
#[cfg(feature = "http")]
pub use http::HttpBackend;
pub use osc::OscBackend;
pub use query::{
    ImageFormat, InferenceBackend, PixelLayout, QueryDefaults, QueryInput, RawImage,
    encode_image, image_payload, insert_image,
};

/// Version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the version of the library.
pub fn version() -> &'static str {
    VERSION
}
