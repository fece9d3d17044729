// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The persisted form of a region GC procedure.
//!
//! Records are protobuf messages, so a record written by an older version
//! decodes with newer code and vice versa as long as fields are only ever
//! appended: never renumber, retype or reuse a tag below.

use bytes::Bytes;

use crate::error::CodecError;
use crate::region::{RegionIdentity, TableId};
use crate::state::GcRegionState;

/// A persisted procedure.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoProcedureRecord {
    /// Which kind of procedure this is.
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(uint64, tag = "2")]
    pub proc_id: u64,
    /// A [`GcRegionState::number`].
    #[prost(int32, tag = "3")]
    pub state: i32,
    #[prost(message, optional, tag = "4")]
    pub region: Option<ProtoRegionIdentity>,
    #[prost(string, optional, tag = "5")]
    pub last_error: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRegionIdentity {
    #[prost(string, tag = "1")]
    pub table_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub start_key: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub end_key: Bytes,
    #[prost(uint64, tag = "4")]
    pub region_id: u64,
    #[prost(uint32, tag = "5")]
    pub replica_id: u32,
}

/// A rust type that has a protobuf representation.
pub trait RustType<Proto>: Sized {
    fn into_proto(&self) -> Proto;

    fn from_proto(proto: Proto) -> Result<Self, CodecError>;
}

impl RustType<ProtoRegionIdentity> for RegionIdentity {
    fn into_proto(&self) -> ProtoRegionIdentity {
        ProtoRegionIdentity {
            table_id: self.table_id().as_str().to_owned(),
            start_key: self.start_key().clone(),
            end_key: self.end_key().clone(),
            region_id: self.region_id(),
            replica_id: self.replica_id(),
        }
    }

    fn from_proto(proto: ProtoRegionIdentity) -> Result<Self, CodecError> {
        if proto.table_id.is_empty() {
            return Err(CodecError::MissingField("region.table_id"));
        }
        Ok(RegionIdentity::new(
            TableId::new(proto.table_id),
            proto.start_key,
            proto.end_key,
            proto.region_id,
            proto.replica_id,
        ))
    }
}

impl RustType<i32> for GcRegionState {
    fn into_proto(&self) -> i32 {
        self.number()
    }

    fn from_proto(proto: i32) -> Result<Self, CodecError> {
        GcRegionState::from_number(proto).ok_or(CodecError::UnknownState(proto))
    }
}
