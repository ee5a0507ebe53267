//! DSync Protocol - how diffs live in the shared map
//!
//! Replicas exchange diffs through a shared key-value map. Each diff is
//! written as a JSON envelope under `diff:<id>`; every element is mirrored
//! under `element:<id>`, with the fields modifications touch kept separately
//! under `field:<id>#<field>`.
//!
//! ## Envelope
//! ```text
//! {"v":1,"id":"..","clientId":"..","timestamp":..,"encoding":"json","payload":{..}}
//! {"v":1,..,"encoding":"msgpack+gzip+base64","payload":"H4sIAAAA.."}
//! ```

pub mod envelope;
pub mod error;
pub mod keys;
pub mod registry;

pub use envelope::{decode_diff, encode_diff, DiffEnvelope, Encoding, DEFAULT_COMPRESSION_THRESHOLD};
pub use error::{ProtocolError, ProtocolResult};
pub use keys::{diff_key, element_key, MapKey};
pub use registry::{field_entries, field_key, field_prefix, FieldEntry, FieldValue};
