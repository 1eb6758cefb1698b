//! 常用类型一次性导入：`use courier_core::prelude::*;`

pub use crate::{
    Result, async_trait,
    context::{MessageContext, TransportMetadata},
    dispatch::{HandlerDispatchTable, HandlerOutput, HandlerTableBuilder},
    error::{CoreError, ErrorCategory, ErrorKind},
    message::{Envelope, Message, TypeKey},
    pipeline::{Behavior, BehaviorDescriptor, ChainOutcome, Next},
    resolve::{ResolutionScope, ServiceResolver},
    sequence::SequenceNumber,
    transport::{Receiver, Sender},
};
