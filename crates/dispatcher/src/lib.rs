//! # 任务分派
//!
//! 通过显式的注册调用把处理函数绑定到任务标识，返回的 [`TaskHandle`] 按照进程级的
//! [`TaskRunMethod`](processor_core::config::TaskRunMethod) 决定如何执行：
//! 同步执行、后台执行，或者写入任务表交给处理器。

pub mod dispatcher;
pub mod handle;

pub use dispatcher::TaskDispatcher;
pub use handle::TaskHandle;
