// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identities of tables and regions.

use std::fmt;

use bytes::Bytes;

/// The identity of a table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(String);

impl TableId {
    pub fn new(name: impl Into<String>) -> Self {
        TableId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The name of a region, unique among every region ever created.
///
/// This is what the exclusive region lock is keyed by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionName(String);

impl RegionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable description of a region: the key range `[start_key,
/// end_key)` of a table.
///
/// An empty `end_key` means the region extends to the end of the table.
/// `region_id` is the region's creation stamp, which tells apart successive
/// regions that cover the same key range (e.g. before and after a merge).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegionIdentity {
    table_id: TableId,
    start_key: Bytes,
    end_key: Bytes,
    region_id: u64,
    replica_id: u32,
}

impl RegionIdentity {
    pub fn new(
        table_id: TableId,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
        region_id: u64,
        replica_id: u32,
    ) -> Self {
        RegionIdentity {
            table_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
            replica_id,
        }
    }

    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn start_key(&self) -> &Bytes {
        &self.start_key
    }

    pub fn end_key(&self) -> &Bytes {
        &self.end_key
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    /// The unique name of this region: `<table>,<start key>,<region id>`,
    /// suffixed with `_<replica>` for non-default replicas.
    ///
    /// Non-printable bytes of the start key are escaped.
    pub fn name(&self) -> RegionName {
        let mut name = format!(
            "{},{},{}",
            self.table_id,
            self.start_key.escape_ascii(),
            self.region_id
        );
        if self.replica_id != 0 {
            name.push_str(&format!("_{:04}", self.replica_id));
        }
        RegionName(name)
    }

    /// A compact rendering for log lines.
    pub fn short_name(&self) -> String {
        match self.replica_id {
            0 => format!("{}/{}", self.table_id, self.region_id),
            replica => format!("{}/{}_{:04}", self.table_id, self.region_id, replica),
        }
    }
}

impl fmt::Display for RegionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, \"{}\", \"{}\") id={}",
            self.table_id,
            self.start_key.escape_ascii(),
            self.end_key.escape_ascii(),
            self.region_id,
        )?;
        if self.replica_id != 0 {
            write!(f, " replica={}", self.replica_id)?;
        }
        Ok(())
    }
}
