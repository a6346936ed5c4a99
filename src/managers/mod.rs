// Managers - state-changing operations on a database
//
// Managers take component-indexed groups of rows and apply them under a
// single transaction, which keeps foreign keys and cascading deletes
// consistent. Collecting what to insert is the mapper's job; `sync` ties the
// two together, sweeping inserts out of the mapper's collector chunk by chunk.

pub mod fts;
pub mod sql;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

use crate::co3::Co3;
use crate::collector::Inserts;
use crate::components::Component;
use crate::config::SyncOptions;
use crate::error::Result;
use crate::mapper::Mapper;
use crate::schema::Schema;

pub use fts::{FtsManager, FTS_TOKENIZERS};
pub use sql::SqlManager;

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkReport {
    /// Objects collected in the chunk
    pub size: usize,
    /// Records staged from those objects
    pub inserts: usize,
    pub seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub limit: usize,
    pub chunks: Vec<ChunkReport>,
    pub total_inserts: usize,
    /// Merged inserts of a dry run; nothing was written
    pub dry_inserts: Option<Inserts>,
}

impl SyncReport {
    fn start(limit: usize, dry: bool) -> Self {
        let now = Utc::now();
        SyncReport {
            started_at: now,
            finished_at: now,
            limit,
            chunks: Vec::new(),
            total_inserts: 0,
            dry_inserts: dry.then(Inserts::new),
        }
    }

    pub fn total_objects(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn total_seconds(&self) -> f64 {
        self.chunks.iter().map(|c| c.seconds).sum()
    }

    pub fn average_chunk_size(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        self.total_objects() as f64 / self.chunks.len() as f64
    }

    pub fn log_summary(&self, chunk_time: f64) {
        let num_chunks = self.chunks.len().max(1) as f64;
        let avg_time = self.total_seconds() / num_chunks;
        let time_match = if chunk_time > 0.0 { avg_time / chunk_time * 100.0 } else { 0.0 };

        info!("Sync report:");
        info!("    Total chunks         : {}", self.chunks.len());
        info!("    Total objects        : {} / {}", self.total_objects(), self.limit);
        info!("    Total inserts        : {}", self.total_inserts);
        info!("    Average chunk size   : {:.2}", self.average_chunk_size());
        info!("    Total time spent     : {:.2}s", self.total_seconds());
        info!("    Average time / chunk : {:.2}s / {}s", avg_time, chunk_time);
        info!("    Percent time match   : {:.2}%", time_match);
    }
}

/// Rows carried over per table by a migration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    pub tables: BTreeMap<String, usize>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.tables.values().sum()
    }
}

// ============================================================================
// MANAGER TRAIT
// ============================================================================

pub trait Manager<C: Component> {
    /// Drop and create every component of the schema
    fn recreate(&self, schema: &Schema<C>) -> Result<()>;

    /// Apply component-indexed inserts in one transaction; returns rows written
    fn insert(&self, schema: &Schema<C>, inserts: &Inserts) -> Result<usize>;

    /// Bring storage in line with `schema`, keeping the rows that still fit
    fn migrate(&self, schema: &Schema<C>) -> Result<MigrationReport>;

    /// Collect `objects` through `mapper` and insert them in adaptive chunks
    ///
    /// Chunk sizes are re-estimated after every chunk so each takes about
    /// `chunk_time` seconds, capped at `chunk_size_cap`. A non-positive
    /// `chunk_time` syncs everything in one chunk.
    fn sync(&self, mapper: &mut Mapper<C>, objects: &[&dyn Co3], opts: &SyncOptions) -> Result<SyncReport> {
        let limit = match opts.limit {
            0 => objects.len(),
            n => n.min(objects.len()),
        };
        let mut report = SyncReport::start(limit, opts.dry);

        if limit == 0 {
            info!("Sync has nothing to do, exiting");
            return Ok(report);
        }

        let mut chunk_size = if opts.chunk_time <= 0.0 {
            limit
        } else {
            // initial guess of 5s per object
            opts.chunk_size(5.0)
        };

        let mut done = 0;
        while done < limit {
            let chunk_limit = chunk_size.min(limit - done);
            let chunk = &objects[done..done + chunk_limit];
            info!(
                "Adaptive chunked sync [size {} (max {})] [{}/{}]",
                chunk_limit, opts.chunk_size_cap, done, limit
            );

            let start = Instant::now();
            let mut receipts = Vec::new();
            for obj in chunk {
                receipts.extend(mapper.collect(*obj, None, None));
            }
            let inserts = mapper.collector_mut().collect_inserts(Some(&receipts));
            let seconds = start.elapsed().as_secs_f64();

            let staged: usize = inserts.values().map(Vec::len).sum();
            match report.dry_inserts.as_mut() {
                Some(dry) => {
                    for (component, rows) in inserts {
                        dry.entry(component).or_default().extend(rows);
                    }
                }
                None => {
                    self.insert(mapper.schema(), &inserts)?;
                }
            }

            report.chunks.push(ChunkReport {
                size: chunk_limit,
                inserts: staged,
                seconds,
            });
            report.total_inserts += staged;
            done += chunk_limit;

            if opts.chunk_time > 0.0 {
                chunk_size = opts.chunk_size(seconds / chunk_limit as f64);
            }
        }

        report.finished_at = Utc::now();
        report.log_summary(opts.chunk_time);
        Ok(report)
    }
}
