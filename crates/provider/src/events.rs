//! # Event Decoder
//!
//! Turns the raw `System.Events` storage value of one block into a list of
//! typed [`ChainEvent`]s.
//!
//! ## Wire Format
//!
//! The value is a SCALE-encoded vector of event records:
//!
//! ```text
//! Compact<u32> count
//! count × {
//!     Phase            enum { ApplyExtrinsic(u32), Finalization, Initialization }
//!     pallet index     u8
//!     event index      u8
//!     fields           per event layout
//!     topics           Vec<[u8; 32]>
//! }
//! ```
//!
//! [`EventMetadata`] maps `(pallet index, event index)` to the event's name and
//! field layout. Events the agent cares about are decoded into typed structs;
//! every other event is skipped field by field using its layout. An index pair
//! missing from the metadata fails the whole block (the caller logs and skips it).
//!
//! ## Ordering
//!
//! The returned list is stably ordered by [`EventKind`]: order events first,
//! then deployment events, and decode order within a kind.

use std::collections::HashMap;

use codec::{Compact, Decode, Encode};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("SCALE decode error: {0}")]
    Codec(#[from] codec::Error),

    #[error("event ({pallet_index}, {event_index}) not present in metadata")]
    UnknownEvent { pallet_index: u8, event_index: u8 },

    #[error("{0} trailing bytes after event records")]
    TrailingBytes(usize),
}

// ════════════════════════════════════════════════════════════════════════════════
// RECORD TYPES
// ════════════════════════════════════════════════════════════════════════════════

pub type AccountId = [u8; 32];

/// `0x`-prefixed hex rendering of an account id.
pub fn account_to_address(account: &AccountId) -> String {
    format!("0x{}", hex::encode(account))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum Phase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

/// `ResourceOrder.CreateOrderSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OrderCreated {
    pub account: AccountId,
    pub order_index: u64,
    pub resource_index: u64,
    /// Rental duration in hours.
    pub duration: u32,
    pub deploy_type: u32,
    pub public_key: String,
}

/// `ResourceOrder.OrderExecSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OrderExecuted {
    pub account: AccountId,
    pub order_index: u64,
    pub resource_index: u64,
    pub agreement_index: u64,
}

/// `ResourceOrder.ReNewOrderSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OrderRenewed {
    pub account: AccountId,
    pub order_index: u64,
    pub resource_index: u64,
    pub agreement_index: u64,
}

/// `ResourceOrder.WithdrawLockedOrderPriceSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OrderWithdrawn {
    pub account: AccountId,
    pub order_index: u64,
}

/// `ResourceOrder.CancelAgreementSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AgreementCancelled {
    pub account: AccountId,
    pub agreement_index: u64,
    pub order_index: u64,
}

/// `Provider.DeploymentDApp`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentRequested {
    pub peer_id: String,
    pub cpu: u8,
    pub memory: u8,
    pub start_method: u8,
    pub command: String,
    pub dapp_index: u64,
}

/// `Provider.ResourceHeartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ResourceHeartbeat {
    pub peer_id: String,
    pub dapps: Vec<u64>,
}

/// `Provider.DAppHeartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentHeartbeat {
    pub account: AccountId,
    pub dapp_name: String,
}

/// `Provider.DAppRedistribution`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentRedistributed {
    pub dapps: Vec<String>,
}

/// `Provider.EndDAppSuccess`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentEnded {
    pub account: AccountId,
    pub dapp_name: String,
    pub dapp_index: u64,
}

/// `Provider.StopDApp`
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DeploymentStopped {
    pub peer_id: String,
    pub dapp_index: u64,
}

// ════════════════════════════════════════════════════════════════════════════════
// EVENT KINDS
// ════════════════════════════════════════════════════════════════════════════════

/// Events the agent recognises. Declaration order is the dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    OrderCreated,
    OrderExecuted,
    OrderRenewed,
    OrderWithdrawn,
    AgreementCancelled,
    DeploymentRequested,
    ResourceHeartbeat,
    DeploymentHeartbeat,
    DeploymentRedistributed,
    DeploymentEnded,
    DeploymentStopped,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::OrderCreated,
        EventKind::OrderExecuted,
        EventKind::OrderRenewed,
        EventKind::OrderWithdrawn,
        EventKind::AgreementCancelled,
        EventKind::DeploymentRequested,
        EventKind::ResourceHeartbeat,
        EventKind::DeploymentHeartbeat,
        EventKind::DeploymentRedistributed,
        EventKind::DeploymentEnded,
        EventKind::DeploymentStopped,
    ];

    /// `(pallet, event)` names as they appear in runtime metadata.
    pub fn names(self) -> (&'static str, &'static str) {
        match self {
            EventKind::OrderCreated => ("ResourceOrder", "CreateOrderSuccess"),
            EventKind::OrderExecuted => ("ResourceOrder", "OrderExecSuccess"),
            EventKind::OrderRenewed => ("ResourceOrder", "ReNewOrderSuccess"),
            EventKind::OrderWithdrawn => ("ResourceOrder", "WithdrawLockedOrderPriceSuccess"),
            EventKind::AgreementCancelled => ("ResourceOrder", "CancelAgreementSuccess"),
            EventKind::DeploymentRequested => ("Provider", "DeploymentDApp"),
            EventKind::ResourceHeartbeat => ("Provider", "ResourceHeartbeat"),
            EventKind::DeploymentHeartbeat => ("Provider", "DAppHeartbeat"),
            EventKind::DeploymentRedistributed => ("Provider", "DAppRedistribution"),
            EventKind::DeploymentEnded => ("Provider", "EndDAppSuccess"),
            EventKind::DeploymentStopped => ("Provider", "StopDApp"),
        }
    }

    pub fn from_names(pallet: &str, event: &str) -> Option<EventKind> {
        Self::ALL.into_iter().find(|k| k.names() == (pallet, event))
    }

    /// Field layout, used to describe these events in metadata.
    pub fn field_types(self) -> Vec<FieldType> {
        use FieldType::*;
        match self {
            EventKind::OrderCreated => vec![AccountId, U64, U64, U32, U32, Bytes],
            EventKind::OrderExecuted | EventKind::OrderRenewed => {
                vec![AccountId, U64, U64, U64]
            }
            EventKind::OrderWithdrawn => vec![AccountId, U64],
            EventKind::AgreementCancelled => vec![AccountId, U64, U64],
            EventKind::DeploymentRequested => vec![Bytes, U8, U8, U8, Bytes, U64],
            EventKind::ResourceHeartbeat => vec![Bytes, Sequence(Box::new(U64))],
            EventKind::DeploymentHeartbeat => vec![AccountId, Bytes],
            EventKind::DeploymentRedistributed => vec![Sequence(Box::new(Bytes))],
            EventKind::DeploymentEnded => vec![AccountId, Bytes, U64],
            EventKind::DeploymentStopped => vec![Bytes, U64],
        }
    }

    fn decode_event(self, input: &mut &[u8]) -> Result<ChainEvent, codec::Error> {
        Ok(match self {
            EventKind::OrderCreated => ChainEvent::OrderCreated(Decode::decode(input)?),
            EventKind::OrderExecuted => ChainEvent::OrderExecuted(Decode::decode(input)?),
            EventKind::OrderRenewed => ChainEvent::OrderRenewed(Decode::decode(input)?),
            EventKind::OrderWithdrawn => ChainEvent::OrderWithdrawn(Decode::decode(input)?),
            EventKind::AgreementCancelled => {
                ChainEvent::AgreementCancelled(Decode::decode(input)?)
            }
            EventKind::DeploymentRequested => {
                ChainEvent::DeploymentRequested(Decode::decode(input)?)
            }
            EventKind::ResourceHeartbeat => ChainEvent::ResourceHeartbeat(Decode::decode(input)?),
            EventKind::DeploymentHeartbeat => {
                ChainEvent::DeploymentHeartbeat(Decode::decode(input)?)
            }
            EventKind::DeploymentRedistributed => {
                ChainEvent::DeploymentRedistributed(Decode::decode(input)?)
            }
            EventKind::DeploymentEnded => ChainEvent::DeploymentEnded(Decode::decode(input)?),
            EventKind::DeploymentStopped => ChainEvent::DeploymentStopped(Decode::decode(input)?),
        })
    }
}

/// A decoded event the agent recognises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    OrderCreated(OrderCreated),
    OrderExecuted(OrderExecuted),
    OrderRenewed(OrderRenewed),
    OrderWithdrawn(OrderWithdrawn),
    AgreementCancelled(AgreementCancelled),
    DeploymentRequested(DeploymentRequested),
    ResourceHeartbeat(ResourceHeartbeat),
    DeploymentHeartbeat(DeploymentHeartbeat),
    DeploymentRedistributed(DeploymentRedistributed),
    DeploymentEnded(DeploymentEnded),
    DeploymentStopped(DeploymentStopped),
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::OrderCreated(_) => EventKind::OrderCreated,
            ChainEvent::OrderExecuted(_) => EventKind::OrderExecuted,
            ChainEvent::OrderRenewed(_) => EventKind::OrderRenewed,
            ChainEvent::OrderWithdrawn(_) => EventKind::OrderWithdrawn,
            ChainEvent::AgreementCancelled(_) => EventKind::AgreementCancelled,
            ChainEvent::DeploymentRequested(_) => EventKind::DeploymentRequested,
            ChainEvent::ResourceHeartbeat(_) => EventKind::ResourceHeartbeat,
            ChainEvent::DeploymentHeartbeat(_) => EventKind::DeploymentHeartbeat,
            ChainEvent::DeploymentRedistributed(_) => EventKind::DeploymentRedistributed,
            ChainEvent::DeploymentEnded(_) => EventKind::DeploymentEnded,
            ChainEvent::DeploymentStopped(_) => EventKind::DeploymentStopped,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// METADATA
// ════════════════════════════════════════════════════════════════════════════════

/// Minimal type vocabulary needed to step over events the agent ignores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    U128,
    Bool,
    /// 32-byte account id.
    AccountId,
    /// 32-byte hash.
    Hash,
    /// Compact-length-prefixed bytes (also strings).
    Bytes,
    /// Compact-encoded integer.
    Compact,
    Sequence(Box<FieldType>),
    Tuple(Vec<FieldType>),
    Option(Box<FieldType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub pallet: String,
    pub name: String,
    pub fields: Vec<FieldType>,
}

/// Event table of the running chain, keyed by `(pallet index, event index)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    events: HashMap<(u8, u8), EventDescriptor>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        pallet_index: u8,
        event_index: u8,
        pallet: impl Into<String>,
        name: impl Into<String>,
        fields: Vec<FieldType>,
    ) {
        self.events.insert(
            (pallet_index, event_index),
            EventDescriptor {
                pallet: pallet.into(),
                name: name.into(),
                fields,
            },
        );
    }

    /// Describe a recognised event at the given indices.
    pub fn insert_known(&mut self, pallet_index: u8, event_index: u8, kind: EventKind) {
        let (pallet, name) = kind.names();
        self.insert(pallet_index, event_index, pallet, name, kind.field_types());
    }

    pub fn get(&self, pallet_index: u8, event_index: u8) -> Option<&EventDescriptor> {
        self.events.get(&(pallet_index, event_index))
    }

    /// Indices under which `kind` is registered.
    pub fn index_of(&self, kind: EventKind) -> Option<(u8, u8)> {
        let (pallet, name) = kind.names();
        self.events
            .iter()
            .find(|(_, d)| d.pallet == pallet && d.name == name)
            .map(|(idx, _)| *idx)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn skip_field(input: &mut &[u8], ty: &FieldType) -> Result<(), codec::Error> {
    match ty {
        FieldType::U8 | FieldType::Bool => {
            u8::decode(input)?;
        }
        FieldType::U16 => {
            u16::decode(input)?;
        }
        FieldType::U32 => {
            u32::decode(input)?;
        }
        FieldType::U64 => {
            u64::decode(input)?;
        }
        FieldType::U128 => {
            u128::decode(input)?;
        }
        FieldType::AccountId | FieldType::Hash => {
            <[u8; 32]>::decode(input)?;
        }
        FieldType::Bytes => {
            Vec::<u8>::decode(input)?;
        }
        FieldType::Compact => {
            Compact::<u128>::decode(input)?;
        }
        FieldType::Sequence(inner) => {
            let Compact(len) = Compact::<u32>::decode(input)?;
            for _ in 0..len {
                skip_field(input, inner)?;
            }
        }
        FieldType::Tuple(fields) => {
            for f in fields {
                skip_field(input, f)?;
            }
        }
        FieldType::Option(inner) => match u8::decode(input)? {
            0 => {}
            1 => skip_field(input, inner)?,
            _ => return Err("invalid Option discriminant".into()),
        },
    }
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════════
// DECODER
// ════════════════════════════════════════════════════════════════════════════════

/// Stateless decoder for `System.Events` values.
pub struct EventDecoder;

impl EventDecoder {
    /// Decode one block's event records.
    ///
    /// Fails as a whole on malformed input or an index pair missing from
    /// `metadata`; no partial result is returned.
    pub fn decode(raw: &[u8], metadata: &EventMetadata) -> Result<Vec<ChainEvent>, DecodeError> {
        let input = &mut &raw[..];
        let Compact(count) = Compact::<u32>::decode(input)?;
        let mut events = Vec::new();

        for _ in 0..count {
            let _phase = Phase::decode(input)?;
            let pallet_index = u8::decode(input)?;
            let event_index = u8::decode(input)?;
            let descriptor = metadata.get(pallet_index, event_index).ok_or(
                DecodeError::UnknownEvent {
                    pallet_index,
                    event_index,
                },
            )?;

            match EventKind::from_names(&descriptor.pallet, &descriptor.name) {
                Some(kind) => events.push(kind.decode_event(input)?),
                None => {
                    for field in &descriptor.fields {
                        skip_field(input, field)?;
                    }
                }
            }

            let _topics = Vec::<[u8; 32]>::decode(input)?;
        }

        if !input.is_empty() {
            return Err(DecodeError::TrailingBytes(input.len()));
        }

        events.sort_by_key(ChainEvent::kind);
        Ok(events)
    }
}

/// Builds a `System.Events` value. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct EventRecordsBuilder {
    count: u32,
    body: Vec<u8>,
}

impl EventRecordsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record whose fields are `event`'s SCALE encoding.
    pub fn push<E: Encode>(mut self, pallet_index: u8, event_index: u8, event: &E) -> Self {
        self.push_raw(pallet_index, event_index, &event.encode());
        self
    }

    /// Append a record with pre-encoded fields.
    pub fn push_raw(&mut self, pallet_index: u8, event_index: u8, fields: &[u8]) {
        Phase::ApplyExtrinsic(self.count).encode_to(&mut self.body);
        self.body.push(pallet_index);
        self.body.push(event_index);
        self.body.extend_from_slice(fields);
        Vec::<[u8; 32]>::new().encode_to(&mut self.body);
        self.count += 1;
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Compact(self.count).encode();
        out.extend(self.body);
        out
    }
}
