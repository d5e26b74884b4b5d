//! Command buffers and the pools that own them

mod buffer;
mod pool;

pub use buffer::{
    BarrierFlags, BindPoint, CommandBuffer, DescriptorState, Level, Status, UsageFlags, BEGIN_NOP_PAYLOAD,
    BEGIN_RESERVE_WORDS, MAX_DESCRIPTOR_SETS,
};
pub use pool::{CommandBufferHandle, CommandPool, PoolResetFlags};
