//! Consumers of part records: the admission gate, aggregator, and deleter.

use std::fs;
use std::io::{self, PipeReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use super::{BundlePart, PartWriter};
use crate::Result;
use crate::pipeline::PipelineHandle;
use crate::stage::StageId;

/// Counting gate bounding how many written parts may await consumption.
///
/// Backed by a bounded channel of tokens: acquiring sends a token and
/// blocks while `capacity` tokens are outstanding, releasing takes one back.
#[derive(Debug, Clone)]
pub struct PartGate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl PartGate {
    /// Creates a gate admitting `capacity` pending parts (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Blocks until a slot is free.
    pub fn acquire(&self) -> PartPermit {
        // Both channel ends live in `self`, so the send cannot fail.
        let _ = self.tx.send(());
        PartPermit {
            gate: self.clone(),
            armed: true,
        }
    }

    /// Frees one slot. A release without an outstanding permit is ignored.
    pub fn release(&self) {
        let _ = self.rx.try_recv();
    }

    /// Number of slots currently taken.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// One acquired slot of a [`PartGate`].
///
/// Dropping the permit frees the slot, so a part that never got written
/// does not leak one. [`hand_off`](Self::hand_off) transfers responsibility
/// for the slot to whoever consumes the part.
#[derive(Debug)]
#[must_use = "dropping a permit frees its slot immediately"]
pub struct PartPermit {
    gate: PartGate,
    armed: bool,
}

impl PartPermit {
    /// Keeps the slot taken until [`PartGate::release`] is called.
    pub fn hand_off(mut self) {
        self.armed = false;
    }
}

impl Drop for PartPermit {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release();
        }
    }
}

/// Runs a [`PartWriter`] over `source` as a stage of `handle`, sending each
/// completed part on the returned channel.
///
/// The stage stops early when `stop` is set or the receiver is dropped.
pub fn spawn_part_writer(
    handle: &mut PipelineHandle,
    source: PipeReader,
    prefix: PathBuf,
    part_size: u64,
    chunk_size: usize,
    gate: Option<PartGate>,
    stop: Arc<AtomicBool>,
) -> Result<Receiver<BundlePart>> {
    let (tx, rx) = unbounded();
    let mut writer = PartWriter::new(source, prefix, part_size, chunk_size).with_stop(stop);
    if let Some(gate) = gate {
        writer = writer.with_gate(gate);
    }
    handle.attach(StageId::SplitParts, move || {
        let mut count = 0u32;
        for part in writer {
            if tx.send(part?).is_err() {
                log::debug!("part consumer went away after {count} parts");
                break;
            }
            count += 1;
        }
        log::debug!("split into {count} parts");
        Ok(())
    })?;
    Ok(rx)
}

/// Collects every record from `input` in arrival order, forwarding each to
/// `tee` if given.
pub fn aggregate(input: Receiver<BundlePart>, tee: Option<Sender<BundlePart>>) -> Vec<BundlePart> {
    let mut parts = Vec::new();
    for part in input {
        if let Some(tee) = &tee {
            // A closed tee does not stop collection.
            let _ = tee.send(part.clone());
        }
        parts.push(part);
    }
    parts
}

/// Runs [`aggregate`] as a stage of `handle`; the full list arrives on the
/// returned channel once `input` closes.
pub fn spawn_aggregator(
    handle: &mut PipelineHandle,
    input: Receiver<BundlePart>,
    tee: Option<Sender<BundlePart>>,
) -> Result<Receiver<Vec<BundlePart>>> {
    let (tx, rx) = bounded(1);
    handle.attach(StageId::AggregateParts, move || {
        let parts = aggregate(input, tee);
        log::debug!("aggregated {} parts", parts.len());
        let _ = tx.send(parts);
        Ok(())
    })?;
    Ok(rx)
}

/// Deletes the file of every record from `input`, forwarding each record
/// to `tee` afterwards if given. Returns how many files were removed.
///
/// Missing files and removal errors are logged and skipped; the record is
/// still forwarded.
pub fn delete_parts(input: Receiver<BundlePart>, tee: Option<Sender<BundlePart>>) -> usize {
    let mut removed = 0;
    for part in input {
        match fs::remove_file(&part.path) {
            Ok(()) => {
                log::debug!("deleted part {}", part.path.display());
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("part {} was already gone", part.path.display());
            }
            Err(e) => log::warn!("could not delete part {}: {e}", part.path.display()),
        }
        if let Some(tee) = &tee {
            let _ = tee.send(part);
        }
    }
    removed
}

/// Runs [`delete_parts`] as a stage of `handle`.
pub fn spawn_deleter(
    handle: &mut PipelineHandle,
    input: Receiver<BundlePart>,
    tee: Option<Sender<BundlePart>>,
) -> Result<()> {
    handle.attach(StageId::DeleteParts, move || {
        let removed = delete_parts(input, tee);
        log::debug!("deleted {removed} parts");
        Ok(())
    })
}
