/*!
 * Upstream stream handling
 *
 * - classification: decide whether an upstream is a direct file, an HLS master
 *   or an HLS media playlist, and whether a single rendition can be collapsed.
 * - collapsing: poll a clear MPEG-TS media playlist and emit its segments as one
 *   continuous byte stream.
 */
pub mod classification;
pub mod collapsing;

pub use classification::{
    ClassificationError, ClassificationPolicy, ClassificationResult, HttpManifestFetcher,
    ManifestFetcher, StreamClassifier, TransportMode,
};
pub use collapsing::{CollapsingConfig, CollapsingError, HlsFetcher, HttpHlsFetcher};
