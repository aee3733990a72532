//! # Database Handle
//!
//! The single owner of a database: the pager (file, WAL, cache), the
//! loaded catalog, and the degraded flag. Collections are addressed by
//! name and handed out as exclusive borrows of this handle, which is how
//! the engine stays single-writer without any locking.
//!
//! Opening runs WAL recovery when the log holds records past the last
//! checkpoint, then loads the catalog. `flush` is the durability barrier;
//! `close` flushes and checkpoints. A handle that failed a rollback is
//! degraded: reads still work, mutations are refused until reopen.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::info;

use crate::btree::BTree;
use crate::catalog::{Catalog, CollectionMeta};
use crate::collection::{free_collection_storage, Collection};
use crate::error::DbError;
use crate::storage::{Pager, PagerOptions, PageType};

#[derive(Debug)]
pub struct Database {
    pub(crate) pager: Pager,
    pub(crate) catalog: Catalog,
    pub(crate) degraded: bool,
    #[allow(dead_code)]
    path: PathBuf,
}

pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    cache_capacity: usize,
    wal_auto_truncate: bool,
}

impl DatabaseBuilder {
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Page cache capacity in pages. Defaults to 1000.
    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }

    /// Whether checkpoints may drop an oversized WAL body. Defaults to on.
    pub fn wal_auto_truncate(mut self, enabled: bool) -> Self {
        self.wal_auto_truncate = enabled;
        self
    }

    pub fn open(self) -> Result<Database> {
        let path = self
            .path
            .ok_or_else(|| DbError::InvalidArgument("database path not set".to_string()))?;
        let mut pager = Pager::open(
            &path,
            PagerOptions {
                cache_capacity: self.cache_capacity,
                wal_auto_truncate: self.wal_auto_truncate,
            },
        )
        .wrap_err_with(|| format!("opening database at {:?}", path))?;
        let catalog = Catalog::load(&mut pager)?;
        info!(
            ?path,
            collections = catalog.collections.len(),
            "database open"
        );
        Ok(Database {
            pager,
            catalog,
            degraded: false,
            path,
        })
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder {
            path: None,
            cache_capacity: crate::storage::PagerOptions::default().cache_capacity,
            wal_auto_truncate: true,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).open()
    }

    /// Returns a handle to the named collection, creating it on first use.
    pub fn collection(&mut self, name: &str) -> Result<Collection<'_>> {
        validate_collection_name(name)?;

        if let Some(slot) = self
            .catalog
            .collections
            .iter()
            .position(|meta| meta.name == name)
        {
            return Ok(Collection::new(self, slot));
        }

        ensure!(!self.degraded, DbError::Degraded);
        let first = self.pager.allocate_page(PageType::Data)?;
        let page_id = first.id();
        self.pager.write_page(&first)?;
        self.catalog.collections.push(CollectionMeta {
            name: name.to_string(),
            first_page_id: page_id,
            last_page_id: page_id,
            document_count: 0,
            index_page_id: 0,
            indexes: Vec::new(),
        });
        self.catalog.save(&mut self.pager)?;

        let slot = self.catalog.collections.len() - 1;
        Ok(Collection::new(self, slot))
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.catalog
            .collections
            .iter()
            .map(|meta| meta.name.clone())
            .collect()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.catalog.collections.iter().any(|meta| meta.name == name)
    }

    /// Drops a collection, freeing its data pages, overflow chains, and
    /// index trees. Returns false when no such collection exists.
    pub fn drop_collection(&mut self, name: &str) -> Result<bool> {
        ensure!(!self.degraded, DbError::Degraded);

        let Some(slot) = self
            .catalog
            .collections
            .iter()
            .position(|meta| meta.name == name)
        else {
            return Ok(false);
        };

        let meta = self.catalog.collections.remove(slot);
        for index in &meta.indexes {
            BTree::open(&mut self.pager, index.root_page_id, index.unique)?
                .destroy()
                .wrap_err_with(|| format!("dropping index '{}'", index.name))?;
        }
        free_collection_storage(&mut self.pager, &meta)
            .wrap_err_with(|| format!("freeing storage of collection '{}'", name))?;
        self.catalog.save(&mut self.pager)?;
        Ok(true)
    }

    /// True after a failed rollback; mutations are refused until reopen.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Durability barrier: WAL sync, dirty page writeback, data fsync,
    /// header rewrite, checkpoint.
    pub fn flush(&mut self) -> Result<()> {
        self.pager.flush()
    }

    /// Flushes and closes cleanly.
    pub fn close(self) -> Result<()> {
        self.pager.close()
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        DbError::InvalidArgument("collection name is empty".to_string())
    );
    ensure!(
        !name.starts_with("system."),
        DbError::InvalidArgument(format!("collection name '{}' is reserved", name))
    );
    ensure!(
        !name.contains('$') && !name.contains('\0'),
        DbError::InvalidArgument(format!(
            "collection name '{}' contains forbidden characters",
            name
        ))
    );
    Ok(())
}
