#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use stratadb::{
    HandlerRegistry, LocalPeer, MemoryObjectStore, MetaStore, ObjectFormat, ObjectManager,
    ObjectManagerConfig, ObjectMeta, ObjectPeer, ObjectStore, TableKey, TableRef,
};
use stratadb_lib::{
    ColumnSchema, ColumnType, DeltaRow, FragmentPayload, IndexSettings, ObjectId, ObjectIndex,
    Row, TableSchema, Value,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn schema() -> TableSchema {
    TableSchema::new(vec![
        ColumnSchema::new(0, "id", ColumnType::Integer, true),
        ColumnSchema::new(1, "name", ColumnType::Text, false),
    ])
}

pub fn row(id: i64, name: &str) -> Row {
    vec![Value::Int(id), name.into()]
}

/// A local node plus an upstream peer it pulls objects from. Object
/// metadata is registered on both sides (as a pull would); payloads start
/// out only on the peer.
pub struct Harness {
    pub local_meta: Arc<MetaStore>,
    pub local_store: Arc<MemoryObjectStore>,
    pub peer_meta: Arc<MetaStore>,
    pub peer_store: Arc<MemoryObjectStore>,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        init_logging();
        let tmp = TempDir::with_prefix("stratadb_test").unwrap();
        Harness {
            local_meta: Arc::new(MetaStore::open(tmp.path().join("local")).unwrap()),
            local_store: Arc::new(MemoryObjectStore::new()),
            peer_meta: Arc::new(MetaStore::open(tmp.path().join("peer")).unwrap()),
            peer_store: Arc::new(MemoryObjectStore::new()),
            _tmp: tmp,
        }
    }

    pub fn peer(&self) -> LocalPeer {
        LocalPeer::new(self.peer_meta.clone(), self.peer_store.clone())
    }

    /// A manager over the local node that fetches from the peer.
    pub fn manager(&self, config: ObjectManagerConfig) -> ObjectManager {
        let upstream: Arc<dyn ObjectPeer> = Arc::new(self.peer());
        ObjectManager::new(
            config,
            self.local_meta.clone(),
            self.local_store.clone(),
            Some(upstream),
            HandlerRegistry::new(),
        )
        .unwrap()
    }

    pub fn manager_without_upstream(&self, config: ObjectManagerConfig) -> ObjectManager {
        ObjectManager::new(
            config,
            self.local_meta.clone(),
            self.local_store.clone(),
            None,
            HandlerRegistry::new(),
        )
        .unwrap()
    }

    /// Register a fragment everywhere, placing the payload on the peer only.
    pub fn add_fragment(
        &self,
        format: ObjectFormat,
        parent: Option<ObjectId>,
        rows: Vec<DeltaRow>,
    ) -> ObjectId {
        self.add_fragment_sized(format, parent, rows, None)
    }

    /// Same, but lets the registered size differ from the payload's actual
    /// byte count (eviction arithmetic cares about the registered size).
    pub fn add_fragment_sized(
        &self,
        format: ObjectFormat,
        parent: Option<ObjectId>,
        rows: Vec<DeltaRow>,
        size: Option<u64>,
    ) -> ObjectId {
        let payload = FragmentPayload::new(rows);
        let bytes = payload.encode().unwrap();
        let object_id = ObjectId::random();
        self.peer_store.write(&object_id, &bytes).unwrap();
        let meta = ObjectMeta {
            object_id,
            format,
            parent_id: parent,
            namespace: "test".into(),
            size: size.unwrap_or(bytes.len() as u64),
            index: ObjectIndex::build(&schema(), &payload.rows, &IndexSettings::default()),
        };
        self.local_meta.register_object(meta.clone()).unwrap();
        self.peer_meta.register_object(meta).unwrap();
        object_id
    }

    pub fn bind_table(&self, image: &str, head: ObjectId) -> TableRef {
        let key = TableKey::new("ns", "repo", image, "fruits");
        self.local_meta
            .register_table(key.clone(), schema(), head)
            .unwrap();
        self.local_meta.get_table(&key).unwrap()
    }

    /// The chain used throughout: s0 {(1,a),(2,b)}, d1 deletes (1,a),
    /// d2 inserts (3,c), d3 updates (2,b) to (2,B).
    pub fn standard_chain(&self, image: &str) -> (Vec<ObjectId>, TableRef) {
        let s0 = self.add_fragment(
            ObjectFormat::Snap,
            None,
            vec![
                DeltaRow::upsert(row(1, "a")),
                DeltaRow::upsert(row(2, "b")),
            ],
        );
        let d1 = self.add_fragment(
            ObjectFormat::Diff,
            Some(s0),
            vec![DeltaRow::delete(vec![Value::Int(1), Value::Null])],
        );
        let d2 = self.add_fragment(
            ObjectFormat::Diff,
            Some(d1),
            vec![DeltaRow::upsert(row(3, "c"))],
        );
        let d3 = self.add_fragment(
            ObjectFormat::Diff,
            Some(d2),
            vec![DeltaRow::upsert(row(2, "B"))],
        );
        let table = self.bind_table(image, d3);
        (vec![s0, d1, d2, d3], table)
    }
}
