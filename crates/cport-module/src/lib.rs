//! # cport-module: Default implementations
//!
//! Everything that touches the OS: the completion ports, the context
//! slab, buffers, the address codec, the resolver, and the `Engine` that
//! composes them.
//!
//! ## Default stack
//!
//! | Concern            | Default impl   | Alternative                  |
//! |--------------------|----------------|------------------------------|
//! | CompletionPort     | UringPort      | InlinePort (poll(2), tests)  |
//! | Context ownership  | ContextSlab    | -                            |
//! | Kernel buffers     | IoBuffer       | -                            |
//! | Cross-thread wake  | Injector       | -                            |
//!
//! ## Layout
//!
//! - `engine`: `Engine`, `EngineBuilder`, lifecycle
//! - `submit`: write, read, recv_from, send_to, accept, connect, inject_event
//! - `pump`: blocking wait + exactly-once dispatch

pub mod addr_codec;
pub mod buffer;
pub(crate) mod context;
pub mod engine;
pub mod injector;
pub mod inline_port;
pub mod resolver;
pub mod sockinfo;
mod pump;
mod submit;

// Platform selection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring_port;
        pub use uring_port::UringPort as DefaultPort;
    } else {
        compile_error!("cport-module requires Linux (io_uring, eventfd)");
    }
}

pub use buffer::IoBuffer;
pub use engine::{Destination, Engine, EngineBuilder, EngineStats};
pub use injector::Injector;
pub use inline_port::InlinePort;
pub use sockinfo::{socket_info, SocketInfo};
