use std::{any::Any, sync::Arc};

use crate::{
    CoreError, Result,
    error::codes,
    message::{Message, MessageBody},
    resolve::ServiceInstance,
};

/// 调用处理器时的一个实参槽位。
#[derive(Clone, Debug)]
pub enum Argument {
    /// 处理器所属的目标实例，只会出现在第 0 个槽位。
    Target(ServiceInstance),
    /// 当前消息。
    Message(MessageBody),
    /// 从解析作用域取得的服务。
    Service(ServiceInstance),
}

/// 按声明顺序排列的实参列表。
///
/// 槽位下标包含目标实例：声明了目标的处理器，其第一个参数位于下标 `1`。
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    slots: Vec<Argument>,
}

impl Arguments {
    pub fn new(slots: Vec<Argument>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Argument> {
        self.slots.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.slots.iter()
    }

    /// 取出目标实例。
    pub fn target<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        match self.slots.first() {
            Some(Argument::Target(instance)) => downcast_instance::<T>(instance, 0),
            _ => Err(mismatch(0, "target instance")),
        }
    }

    /// 以具体类型取出消息参数。
    pub fn message<M: Message>(&self, index: usize) -> Result<Arc<M>> {
        match self.slots.get(index) {
            Some(Argument::Message(body)) => body
                .downcast::<M>()
                .ok_or_else(|| mismatch(index, std::any::type_name::<M>())),
            _ => Err(mismatch(index, "message")),
        }
    }

    /// 以对象形式取出消息参数，供契约处理器使用。
    pub fn message_ref(&self, index: usize) -> Result<&Arc<dyn Message>> {
        match self.slots.get(index) {
            Some(Argument::Message(body)) => Ok(body.message()),
            _ => Err(mismatch(index, "message")),
        }
    }

    /// 以具体类型取出服务参数。
    pub fn service<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        match self.slots.get(index) {
            Some(Argument::Service(instance)) => downcast_instance::<T>(instance, index),
            _ => Err(mismatch(index, std::any::type_name::<T>())),
        }
    }
}

fn downcast_instance<T: Any + Send + Sync>(
    instance: &ServiceInstance,
    index: usize,
) -> Result<Arc<T>> {
    Arc::clone(instance)
        .downcast::<T>()
        .map_err(|_| mismatch(index, std::any::type_name::<T>()))
}

fn mismatch(index: usize, expected: &str) -> CoreError {
    CoreError::new(
        codes::DISPATCH_ARGUMENT_MISMATCH,
        format!("argument #{index} is not a {expected}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;

    #[derive(Debug)]
    struct Ping(u8);

    impl Message for Ping {}

    struct Clock;

    #[test]
    fn accessors_check_slot_kind_and_type() {
        let envelope = Envelope::new(Ping(3));
        let args = Arguments::new(vec![
            Argument::Message(envelope.body().clone()),
            Argument::Service(Arc::new(Clock)),
        ]);

        assert_eq!(args.message::<Ping>(0).expect("消息").0, 3);
        assert!(args.service::<Clock>(1).is_ok());

        let err = args.service::<Clock>(0).err().expect("槽位类型不符");
        assert_eq!(err.code(), codes::DISPATCH_ARGUMENT_MISMATCH);
        assert!(args.target::<Clock>().is_err());
        assert!(args.message_ref(2).is_err());
    }
}
