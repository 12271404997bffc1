use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::fabric::types::Grant;
use crate::timeq::Cycle;

/// CSV sink receiving one row per crossbar grant.
pub struct GrantTrace<W: Write = BufWriter<File>> {
    writer: W,
    wrote_header: bool,
}

impl GrantTrace {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> GrantTrace<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            wrote_header: false,
        }
    }

    pub fn write_grant(&mut self, cycle: Cycle, dest_name: &str, grant: &Grant) {
        if !self.wrote_header {
            let _ = writeln!(self.writer, "cycle,dest,source,request_id,op,addr");
            self.wrote_header = true;
        }
        let _ = writeln!(
            self.writer,
            "{},{},{},{},{},{:#010x}",
            cycle,
            dest_name,
            grant.source,
            grant.txn.id,
            grant.txn.op.short(),
            grant.txn.addr
        );
    }

    pub fn into_inner(mut self) -> W
    where
        W: Default,
    {
        let _ = self.writer.flush();
        std::mem::take(&mut self.writer)
    }
}

impl<W: Write> Drop for GrantTrace<W> {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
