// rust/snapshot-core/src/serialize/mod.rs

//! Object-graph serialization with externalized storages.
//!
//! Serializing a graph produces a compact metadata stream in which every
//! buffer is replaced by a [`StorageReferenceRecord`], plus the list of root
//! storages whose bytes must follow it. The two are tied together by the
//! sorted storage key list that closes the stream.
//!
//! # Example
//!
//! ```
//! use snapshot_core::graph::{Buffer, Value};
//! use snapshot_core::checkpoint::CheckpointLayout;
//! use snapshot_core::serialize::{deserialize_image, serialize};
//! use std::path::Path;
//!
//! let weights = Buffer::from_f32(&[0.5; 16]);
//! let graph = Value::dict([("weights", Value::Buffer(weights))]);
//!
//! let (metadata, references) = serialize(&graph).unwrap();
//! let layout = CheckpointLayout::new(Path::new("model.pt"), metadata, references).unwrap();
//!
//! let restored = deserialize_image(layout.to_image().into()).unwrap();
//! assert_eq!(restored, graph);
//! ```

mod decoder;
mod encoder;
mod record;
mod table;

pub use decoder::{
    deserialize, deserialize_image, read_header, BufferSource, MapSource, SectionSource,
    StreamHeader,
};
pub use encoder::{serialize, Encoder, PersistentIdHook};
pub use record::{
    Node, PersistentRecord, StorageKey, StorageReferenceRecord, SysInfo, TypeDefinition,
    TypeSizes, ViewMetadata, LENGTH_WORD_SIZE, MAGIC_NUMBER, PROTOCOL_VERSION,
};
pub use table::StorageReferenceTable;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointLayout;
    use crate::error::EngineError;
    use crate::graph::{Buffer, DType, Device, Key, TypeMarker, Value};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::path::Path;

    fn image_of(value: &Value) -> Vec<u8> {
        let (metadata, refs) = serialize(value).unwrap();
        CheckpointLayout::new(Path::new("test.pt"), metadata, refs)
            .unwrap()
            .to_image()
    }

    fn round_trip(value: &Value) -> Value {
        deserialize_image(Bytes::from(image_of(value))).unwrap()
    }

    #[test]
    fn test_round_trip_scalars_and_containers() {
        let graph = Value::dict([
            (Key::from("none"), Value::None),
            (Key::from("flag"), Value::Bool(true)),
            (Key::from("lr"), Value::Float(3e-4)),
            (Key::from("name"), Value::Str("gpt2".into())),
            (Key::from("raw"), Value::Bytes(vec![0, 1, 2])),
            (Key::Int(0), Value::Tuple(vec![Value::Int(-1), Value::List(vec![])])),
        ]);

        assert_eq!(round_trip(&graph), graph);
    }

    #[test]
    fn test_round_trip_buffers() {
        let graph = Value::dict([
            ("w", Value::Buffer(Buffer::from_f32(&[1.5, -2.0, 3.25]))),
            (
                "ids",
                Value::Buffer(Buffer::new(vec![7u8; 16], DType::I64, Device::new("cuda:0")).unwrap()),
            ),
            (
                "empty",
                Value::Buffer(Buffer::new(Vec::<u8>::new(), DType::BF16, Device::cpu()).unwrap()),
            ),
        ]);

        let restored = round_trip(&graph);

        assert_eq!(restored, graph);
        let ids = restored.get("ids").and_then(Value::as_buffer).unwrap();
        assert_eq!(ids.device(), &Device::new("cuda:0"));
        assert_eq!(ids.numel(), Some(2));
        assert!(restored.get("empty").and_then(Value::as_buffer).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_objects_and_types() {
        let class = TypeMarker::new("Linear");
        let graph = Value::List(vec![
            Value::Object {
                class: class.clone(),
                state: Box::new(Value::dict([("bias", Value::Buffer(Buffer::from_f32(&[0.0])))])),
            },
            Value::Object {
                class: class.clone(),
                state: Box::new(Value::None),
            },
            Value::Type(class),
        ]);

        assert_eq!(round_trip(&graph), graph);
    }

    #[test]
    fn test_type_source_embedded_once() {
        let class = TypeMarker::new("Block");
        let graph = Value::List(vec![Value::Type(class.clone()), Value::Type(class)]);

        let (metadata, _) = serialize(&graph).unwrap();
        let header = read_header(&metadata).unwrap();

        assert_eq!(header.type_definitions().len(), 1);
    }

    #[test]
    fn test_aliases_restore_to_one_storage() {
        let shared = Buffer::from_f32(&[1.0, 2.0]);
        let graph = Value::dict([
            ("a", Value::Buffer(shared.clone())),
            ("b", Value::Buffer(shared)),
        ]);

        let (metadata, refs) = serialize(&graph).unwrap();
        let header = read_header(&metadata).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(header.keys.len(), 1);
        assert_eq!(header.records().len(), 2);

        let restored = round_trip(&graph);
        let a = restored.get("a").and_then(Value::as_buffer).unwrap();
        let b = restored.get("b").and_then(Value::as_buffer).unwrap();
        assert!(a.shares_storage(b));
        assert_eq!(a.to_f32_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_views_restore_into_one_buffer() {
        let root = Buffer::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let a = root.clone();
        let b = root.view(8, 8).unwrap();
        let graph = Value::dict([("a", Value::Buffer(a)), ("b", Value::Buffer(b))]);

        let (metadata, refs) = serialize(&graph).unwrap();
        let header = read_header(&metadata).unwrap();
        let records = header.records();

        // One storage, one plain record and one view record.
        assert_eq!(refs.len(), 1);
        assert_eq!(records.iter().filter(|r| r.view.is_none()).count(), 1);
        assert_eq!(records.iter().filter(|r| r.view.is_some()).count(), 1);

        let restored = round_trip(&graph);
        let ra = restored.get("a").and_then(Value::as_buffer).unwrap();
        let rb = restored.get("b").and_then(Value::as_buffer).unwrap();
        assert!(ra.shares_storage(rb));
        assert_eq!(rb.byte_offset(), 8);
        assert_eq!(rb.to_f32_vec().unwrap(), vec![3.0, 4.0]);
        // The view aliases the root's memory rather than holding a copy.
        assert_eq!(rb.as_bytes().as_ptr(), ra.as_bytes()[8..].as_ptr());
    }

    #[test]
    fn test_repeated_view_restores_once() {
        let root = Buffer::from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let half = root.view(0, 8).unwrap();
        let graph = Value::List(vec![Value::Buffer(half.clone()), Value::Buffer(half)]);

        let restored = round_trip(&graph);
        let Value::List(items) = restored else {
            panic!("expected list");
        };
        let first = items[0].as_buffer().unwrap();
        let second = items[1].as_buffer().unwrap();
        assert!(first.shares_storage(second));
        assert_eq!(first.as_bytes().as_ptr(), second.as_bytes().as_ptr());
    }

    #[test]
    fn test_key_list_matches_reference_order() {
        let bufs: Vec<_> = (0..6).map(|i| Buffer::from_f32(&[i as f32; 3])).collect();
        let graph = Value::List(bufs.into_iter().rev().map(Value::Buffer).collect());

        let (metadata, refs) = serialize(&graph).unwrap();
        let header = read_header(&metadata).unwrap();

        let ref_keys: Vec<_> = refs.iter().map(|r| r.key).collect();
        assert_eq!(header.keys, ref_keys);
        assert_eq!(header.metadata_len, metadata.len());
    }

    #[test]
    fn test_deserialize_with_map_source() {
        let buf = Buffer::from_f32(&[9.0, 8.0]);
        let graph = Value::dict([("x", Value::Buffer(buf))]);
        let (metadata, refs) = serialize(&graph).unwrap();

        let mut source = MapSource::new();
        for r in &refs {
            source.insert(r.key, r.data.clone());
        }

        assert_eq!(deserialize(&metadata, &mut source).unwrap(), graph);
    }

    #[test]
    fn test_missing_storage() {
        let graph = Value::Buffer(Buffer::from_f32(&[1.0]));
        let (metadata, _) = serialize(&graph).unwrap();

        let result = deserialize(&metadata, &mut MapSource::new());
        assert!(matches!(result, Err(EngineError::MissingStorage { .. })));
    }

    #[test]
    fn test_truncated_image() {
        let graph = Value::Buffer(Buffer::from_f32(&[1.0, 2.0, 3.0]));
        let mut image = image_of(&graph);
        image.truncate(image.len() - 4);

        let result = deserialize_image(Bytes::from(image));
        assert!(matches!(result, Err(EngineError::MissingStorage { .. })));
    }

    #[test]
    fn test_bad_magic() {
        let mut image = image_of(&Value::Int(1));
        image[0] ^= 0xff;

        let result = deserialize_image(Bytes::from(image));
        assert!(matches!(result, Err(EngineError::IncompatibleFormat { .. })));
    }

    #[test]
    fn test_bad_version() {
        let mut image = image_of(&Value::Int(1));
        // The version follows the 16-byte magic.
        image[16] = image[16].wrapping_add(1);

        let result = deserialize_image(Bytes::from(image));
        assert!(matches!(result, Err(EngineError::IncompatibleFormat { .. })));
    }

    #[test]
    fn test_foreign_sys_info() {
        let mut image = image_of(&Value::Int(1));
        // SysInfo starts after magic (16) and version (2): protocol (2), then byte order.
        image[20] ^= 1;

        let result = deserialize_image(Bytes::from(image));
        assert!(matches!(result, Err(EngineError::IncompatibleFormat { .. })));
    }

    fn arb_buffer() -> impl Strategy<Value = Buffer> {
        prop_oneof![
            prop::collection::vec(any::<f32>().prop_filter("finite", |f| f.is_finite()), 0..64)
                .prop_map(|v| Buffer::from_f32(&v)),
            prop::collection::vec(any::<u8>(), 0..64)
                .prop_map(|v| Buffer::new(v, DType::U8, Device::cpu()).unwrap()),
        ]
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::None),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,8}".prop_map(Value::Str),
            arb_buffer().prop_map(Value::Buffer),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6).prop_map(|m| {
                    Value::Dict(m.into_iter().map(|(k, v)| (Key::Str(k), v)).collect())
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip(graph in arb_value()) {
            let restored = round_trip(&graph);
            prop_assert_eq!(restored, graph);
        }
    }
}
