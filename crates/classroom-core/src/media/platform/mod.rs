//! Platform media sources
//!
//! `MockMediaSource` is always available. `CpalMediaSource` captures real
//! microphones when the `cpal` feature is enabled.

#[cfg(feature = "cpal")]
pub mod cpal_source;
pub mod mock_source;

#[cfg(feature = "cpal")]
pub use cpal_source::CpalMediaSource;
pub use mock_source::MockMediaSource;

use std::sync::Arc;

use super::MediaSource;

/// Create the best media source for this build
pub fn default_media_source() -> Arc<dyn MediaSource> {
    #[cfg(feature = "cpal")]
    {
        Arc::new(CpalMediaSource::new())
    }

    #[cfg(not(feature = "cpal"))]
    {
        Arc::new(MockMediaSource::new())
    }
}
