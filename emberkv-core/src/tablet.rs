//! Tablet ownership and per-table allocators

use crate::index::HashIndex;
use crate::{EmberError, ObjectId, Result, TableId, Tablet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Per-table allocator state shared by every tablet of the table on this
/// server. Both counters are monotone.
#[derive(Debug)]
pub struct Table {
    table_id: TableId,
    next_key: AtomicU64,
    next_version: AtomicU64,
}

impl Table {
    /// Create allocator state for a table.
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            next_key: AtomicU64::new(1),
            next_version: AtomicU64::new(1),
        }
    }

    /// Id of the table this state belongs to.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Allocate an object id not currently present in the index.
    pub fn allocate_key<V: Clone>(&self, index: &HashIndex<V>) -> ObjectId {
        loop {
            let id = self.next_key.fetch_add(1, Ordering::SeqCst);
            if index.lookup(self.table_id, id).is_none() {
                return id;
            }
        }
    }

    /// Allocate the next version for a newly created object.
    pub fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Raise the version floor so every future [`Table::allocate_version`]
    /// returns at least `floor`.
    pub fn raise_to(&self, floor: u64) {
        self.next_version.fetch_max(floor, Ordering::SeqCst);
    }
}

/// The set of tablets this master currently serves, with the `Table`
/// allocator state attached to each table id.
pub struct TabletSet {
    inner: RwLock<TabletSetInner>,
}

struct TabletSetInner {
    tablets: Vec<Tablet>,
    tables: HashMap<TableId, Arc<Table>>,
}

impl TabletSet {
    /// Create an empty tablet set.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TabletSetInner {
                tablets: Vec::new(),
                tables: HashMap::new(),
            }),
        }
    }

    /// Resolve the table serving an object.
    ///
    /// Returns `TableDoesntExist` when no owned tablet covers the object;
    /// this is also how "not served here anymore" surfaces.
    pub fn find(&self, table_id: TableId, object_id: ObjectId) -> Result<Arc<Table>> {
        let inner = self.inner.read();
        for tablet in &inner.tablets {
            if tablet.contains(table_id, object_id) {
                let table = inner
                    .tables
                    .get(&table_id)
                    .expect("tablet without table state");
                return Ok(table.clone());
            }
        }
        Err(EmberError::TableDoesntExist)
    }

    /// Replace the served tablet set.
    ///
    /// `Table` allocator state survives for table ids present in both the
    /// old and new sets; state for departed tables is dropped. The log and
    /// index must already hold a consistent view of any new tablet.
    pub fn set_tablets(&self, new_tablets: Vec<Tablet>) {
        let mut inner = self.inner.write();
        let mut tables = HashMap::new();
        info!("now serving {} tablets", new_tablets.len());
        for tablet in &new_tablets {
            info!(
                "  table {:>6}, start {:>20}, end {:>20}",
                tablet.table_id, tablet.start_object_id, tablet.end_object_id
            );
            let table = inner
                .tables
                .get(&tablet.table_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(Table::new(tablet.table_id)));
            tables.insert(tablet.table_id, table);
        }
        inner.tablets = new_tablets;
        inner.tables = tables;
    }

    /// Snapshot the served tablets.
    pub fn snapshot(&self) -> Vec<Tablet> {
        self.inner.read().tablets.clone()
    }

    /// Number of served tablets.
    pub fn len(&self) -> usize {
        self.inner.read().tablets.len()
    }

    /// Check whether no tablets are served.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TabletSet {
    fn default() -> Self {
        Self::new()
    }
}
