use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use std::sync::LazyLock;
use tonic::metadata::{AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tracing::warn;

use crate::status::RpcError;

/// Base64 engines for lenient binary header decoding.
///
/// Four codecs are tried in order: standard, URL-safe, raw-standard,
/// raw-URL-safe, for maximum compatibility with whatever encoded the value.
static BASE64_ENGINES: LazyLock<Vec<base64::engine::GeneralPurpose>> = LazyLock::new(|| {
    use base64::engine::general_purpose;
    vec![
        general_purpose::STANDARD,
        general_purpose::URL_SAFE,
        general_purpose::STANDARD_NO_PAD,
        general_purpose::URL_SAFE_NO_PAD,
    ]
});

/// Response metadata keys synthesized by the transport itself; never shown
/// to scripts as headers or trailers.
const PSEUDO_HEADERS: [&str; 4] = [
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
    "grpc-encoding",
];

type Entries = Vec<(String, Vec<String>)>;

/// Script-visible metadata: a mutable multi-map keyed by ASCII-lowercase
/// names. Iteration order is the insertion order of each key's first
/// occurrence. Values are strings; `-bin` keys carry base64 text on this
/// side and raw bytes on the wire.
///
/// A read-only view shares storage with its source but rejects mutation;
/// this is how request headers are surfaced to server handlers.
#[derive(Clone, Default)]
pub struct Metadata {
    entries: Arc<Mutex<Entries>>,
    read_only: bool,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Build from `(name, value)` pairs, normalizing names.
    pub fn from_pairs<I, K, V>(pairs: I) -> Metadata
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let md = Metadata::new();
        for (k, v) in pairs {
            md.append(k.as_ref(), v.into());
        }
        md
    }

    /// Replace all values of `name` with the single `value`.
    pub fn set(&self, name: &str, value: impl Into<String>) -> Result<(), RpcError> {
        self.check_mutable()?;
        let name = normalize(name);
        let value = value.into();
        let mut entries = self.lock();
        match entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, values)) => *values = vec![value],
            None => entries.push((name, vec![value])),
        }
        Ok(())
    }

    /// Add a value, keeping existing ones.
    pub fn append(&self, name: &str, value: impl Into<String>) {
        let name = normalize(name);
        let value = value.into();
        let mut entries = self.lock();
        match entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, values)) => values.push(value),
            None => entries.push((name, vec![value])),
        }
    }

    /// First value for `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<String> {
        let name = normalize(name);
        self.lock()
            .iter()
            .find(|(k, _)| *k == name)
            .and_then(|(_, values)| values.first().cloned())
    }

    /// All values for `name`; empty when absent.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        let name = normalize(name);
        self.lock()
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, values)| values.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, name: &str) -> Result<(), RpcError> {
        self.check_mutable()?;
        let name = normalize(name);
        self.lock().retain(|(k, _)| *k != name);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Visit entries in insertion order.
    pub fn for_each(&self, mut f: impl FnMut(&str, &[String])) {
        for (name, values) in self.lock().iter() {
            f(name, values);
        }
    }

    /// Ordered snapshot of all entries.
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        self.lock().clone()
    }

    /// A view over the same storage that rejects mutation.
    pub fn read_only_view(&self) -> Metadata {
        Metadata {
            entries: Arc::clone(&self.entries),
            read_only: true,
        }
    }

    /// Copy all entries of `other` into `self`, appending values.
    pub fn merge_from(&self, other: &Metadata) {
        // Snapshot first: `other` may be a view over the same storage.
        let pairs = other.entries();
        for (name, values) in pairs {
            for value in values {
                self.append(&name, value);
            }
        }
    }

    /// Convert to a tonic map for the wire.
    ///
    /// `-bin` names have their values base64-decoded (four codecs tried,
    /// falling back to the raw bytes); invalid names or values are dropped
    /// with a warning rather than failing the call.
    pub fn to_tonic(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        self.for_each(|name, values| {
            for value in values {
                append_to_tonic(&mut map, name, value);
            }
        });
        map
    }

    /// Append this metadata's entries to an existing tonic map.
    pub fn merge_into_tonic(&self, map: &mut MetadataMap) {
        self.for_each(|name, values| {
            for value in values {
                append_to_tonic(map, name, value);
            }
        });
    }

    /// Build from a tonic map; binary values come across base64-encoded.
    pub fn from_tonic(map: &MetadataMap) -> Metadata {
        let md = Metadata::new();
        for kv in map.iter() {
            match kv {
                KeyAndValueRef::Ascii(key, value) => {
                    if let Ok(value) = value.to_str() {
                        md.append(key.as_str(), value);
                    }
                }
                KeyAndValueRef::Binary(key, value) => {
                    if let Ok(bytes) = value.to_bytes() {
                        let encoded =
                            base64::engine::general_purpose::STANDARD.encode(&bytes);
                        md.append(key.as_str(), encoded);
                    }
                }
            }
        }
        md
    }

    /// Like [`Metadata::from_tonic`] but with transport pseudo-headers
    /// stripped; this is the form surfaced to scripts as response headers
    /// and trailers.
    pub(crate) fn from_tonic_filtered(map: &MetadataMap) -> Metadata {
        let md = Metadata::from_tonic(map);
        let mut entries = md.lock();
        entries.retain(|(name, _)| !PSEUDO_HEADERS.contains(&name.as_str()));
        drop(entries);
        md
    }

    fn check_mutable(&self) -> Result<(), RpcError> {
        if self.read_only {
            return Err(RpcError::invalid_argument("metadata is read-only"));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.lock().iter().map(|(k, v)| (k.clone(), v.clone())))
            .finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn append_to_tonic(map: &mut MetadataMap, name: &str, value: &str) {
    if name.ends_with("-bin") {
        match tonic::metadata::BinaryMetadataKey::from_bytes(name.as_bytes()) {
            Ok(key) => {
                let bytes =
                    try_base64_decode(value).unwrap_or_else(|| value.as_bytes().to_vec());
                let val = tonic::metadata::BinaryMetadataValue::from_bytes(&bytes);
                map.append_bin(key, val);
            }
            Err(_) => {
                warn!(name, "metadata entry dropped: invalid binary key");
            }
        }
    } else {
        match value.parse::<AsciiMetadataValue>() {
            Ok(val) => match tonic::metadata::AsciiMetadataKey::from_bytes(name.as_bytes()) {
                Ok(key) => {
                    map.append(key, val);
                }
                Err(_) => {
                    warn!(name, "metadata entry dropped: invalid key");
                }
            },
            Err(_) => {
                warn!(name, "metadata entry dropped: invalid value");
            }
        }
    }
}

/// Try each base64 codec in turn; `None` when none fit.
fn try_base64_decode(value: &str) -> Option<Vec<u8>> {
    BASE64_ENGINES
        .iter()
        .find_map(|engine| engine.decode(value.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased_on_insertion() {
        let md = Metadata::new();
        md.set("Authorization", "Bearer token123").unwrap();
        assert_eq!(md.get("authorization").as_deref(), Some("Bearer token123"));
        assert_eq!(md.get("AUTHORIZATION").as_deref(), Some("Bearer token123"));
    }

    #[test]
    fn iteration_order_is_first_insertion_order() {
        let md = Metadata::new();
        md.append("x-second", "b");
        md.append("x-first", "a");
        md.append("x-second", "c");
        let names: Vec<String> = md.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["x-second", "x-first"]);
        assert_eq!(md.get_all("x-second"), vec!["b", "c"]);
    }

    #[test]
    fn set_replaces_append_accumulates() {
        let md = Metadata::new();
        md.append("x-k", "1");
        md.append("x-k", "2");
        md.set("x-k", "3").unwrap();
        assert_eq!(md.get_all("x-k"), vec!["3"]);
    }

    #[test]
    fn get_absent_is_none_and_empty() {
        let md = Metadata::new();
        assert_eq!(md.get("missing"), None);
        assert!(md.get_all("missing").is_empty());
    }

    #[test]
    fn remove_deletes_all_values() {
        let md = Metadata::new();
        md.append("x-k", "1");
        md.append("x-k", "2");
        md.remove("X-K").unwrap();
        assert!(md.is_empty());
    }

    #[test]
    fn read_only_view_rejects_mutation_but_tracks_source() {
        let md = Metadata::new();
        md.set("x-k", "v").unwrap();
        let view = md.read_only_view();
        assert!(view.set("x-k", "w").is_err());
        assert!(view.remove("x-k").is_err());
        md.set("x-other", "late").unwrap();
        assert_eq!(view.get("x-other").as_deref(), Some("late"));
    }

    #[test]
    fn tonic_round_trip_ascii() {
        let md = Metadata::new();
        md.set("x-trace", "abc").unwrap();
        md.append("x-multi", "1");
        md.append("x-multi", "2");
        let map = md.to_tonic();
        let back = Metadata::from_tonic(&map);
        assert_eq!(back.get("x-trace").as_deref(), Some("abc"));
        assert_eq!(back.get_all("x-multi"), vec!["1", "2"]);
    }

    #[test]
    fn binary_values_decode_on_the_way_out() {
        let md = Metadata::new();
        // "hello" in standard base64
        md.set("x-data-bin", "aGVsbG8=").unwrap();
        let map = md.to_tonic();
        let val = map.get_bin("x-data-bin").expect("binary header exists");
        assert_eq!(val.to_bytes().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn binary_values_decode_without_padding() {
        let md = Metadata::new();
        md.set("x-data-bin", "aGVsbG8").unwrap();
        let map = md.to_tonic();
        let val = map.get_bin("x-data-bin").expect("binary header exists");
        assert_eq!(val.to_bytes().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn invalid_base64_falls_back_to_raw_bytes() {
        let md = Metadata::new();
        md.set("x-data-bin", "not!valid!").unwrap();
        let map = md.to_tonic();
        let val = map.get_bin("x-data-bin").expect("binary header exists");
        assert_eq!(val.to_bytes().unwrap().as_ref(), b"not!valid!");
    }

    #[test]
    fn pseudo_headers_are_filtered() {
        let mut map = MetadataMap::new();
        map.insert("grpc-status", "0".parse().unwrap());
        map.insert("grpc-message", "ok".parse().unwrap());
        map.insert("x-real", "yes".parse().unwrap());
        let md = Metadata::from_tonic_filtered(&map);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("x-real").as_deref(), Some("yes"));
    }

    #[test]
    fn merge_from_appends_in_order() {
        let a = Metadata::new();
        a.set("x-a", "1").unwrap();
        let b = Metadata::new();
        b.set("x-a", "2").unwrap();
        b.set("x-b", "3").unwrap();
        a.merge_from(&b);
        assert_eq!(a.get_all("x-a"), vec!["1", "2"]);
        assert_eq!(a.get("x-b").as_deref(), Some("3"));
    }
}
