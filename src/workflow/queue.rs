//! FIFO of property reads whose outcomes are kept in enqueue order.

use std::net::SocketAddr;

use crate::object::{ObjectIdentifier, PropertyIdentifier, PropertyValue};
use crate::service::ReadPropertyRequest;

use super::RequestFailure;

/// One property to read from one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyPoint {
    pub address: SocketAddr,
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl PropertyPoint {
    pub fn new(address: SocketAddr, object: ObjectIdentifier, property: PropertyIdentifier) -> Self {
        Self {
            address,
            object,
            property,
            array_index: None,
        }
    }

    pub fn read_request(&self) -> ReadPropertyRequest {
        ReadPropertyRequest {
            object_identifier: self.object,
            property_identifier: self.property,
            array_index: self.array_index,
        }
    }
}

/// What a queued read produced
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Value(PropertyValue),
    Failed(RequestFailure),
}

impl ReadOutcome {
    pub fn value(&self) -> Option<&PropertyValue> {
        match self {
            ReadOutcome::Value(value) => Some(value),
            ReadOutcome::Failed(_) => None,
        }
    }
}

/// Reads handed out one at a time; `results()[i]` belongs to the i-th point
#[derive(Debug, Clone, Default)]
pub struct PropertyReadQueue {
    points: Vec<PropertyPoint>,
    handed_out: usize,
    results: Vec<ReadOutcome>,
}

impl PropertyReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, point: PropertyPoint) {
        self.points.push(point);
    }

    /// Next point to read. None while the previous read is unrecorded or
    /// when nothing is left.
    pub fn pop_next(&mut self) -> Option<PropertyPoint> {
        if self.outstanding().is_some() {
            return None;
        }
        let point = *self.points.get(self.handed_out)?;
        self.handed_out += 1;
        Some(point)
    }

    /// The point handed out but not yet recorded
    pub fn outstanding(&self) -> Option<&PropertyPoint> {
        if self.results.len() < self.handed_out {
            self.points.get(self.results.len())
        } else {
            None
        }
    }

    /// True when every point has been handed out
    pub fn is_empty(&self) -> bool {
        self.handed_out == self.points.len()
    }

    /// Store the outcome of the outstanding read. Returns false when no read
    /// is outstanding.
    pub fn record(&mut self, outcome: ReadOutcome) -> bool {
        if self.outstanding().is_none() {
            return false;
        }
        self.results.push(outcome);
        true
    }

    pub fn points(&self) -> &[PropertyPoint] {
        &self.points
    }

    pub fn results(&self) -> &[ReadOutcome] {
        &self.results
    }
}
