//! 外部协作方的具体实现
//!
//! Dojo记录源、Acunetix节点、粘性分配表与目标工件的文件存储、
//! 外部命令阶段执行器，以及测试用的内存实现。

pub mod acunetix;
pub mod dojo;
pub mod executors;
pub mod memory;
pub mod sticky_file;
pub mod targets_file;

pub use acunetix::AcunetixClient;
pub use dojo::DojoProductTypeStore;
pub use executors::ShellStageExecutor;
pub use memory::{
    MemoryProductTypeStore, MemoryStickyStore, MemoryTargetListStore, ScriptedStageExecutor,
    StaticNodeClient,
};
pub use sticky_file::FileStickyStore;
pub use targets_file::FileTargetListStore;
