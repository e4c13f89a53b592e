use crate::error::DgcError;
use crate::memory::DeviceMemory;
use crate::params::DgcParams;

use super::GeneratorProgram;

/// Launches a generator program.
///
/// A driver backend records a real compute dispatch with `params` as root constants; the
/// program never calls back into the host, so the launch may complete asynchronously.
pub trait ComputeDispatch {
    fn dispatch(
        &mut self,
        program: &GeneratorProgram,
        params: &DgcParams,
        workgroups: u32,
        threads_per_group: u32,
        memory: &dyn DeviceMemory,
    ) -> Result<(), DgcError>;
}

/// Order in which [`CpuDispatch`] visits threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadOrder {
    #[default]
    Forward,
    Reverse,
}

/// Runs every invocation on the calling thread, one after another.
#[derive(Clone, Debug, Default)]
pub struct CpuDispatch {
    order: ThreadOrder,
    threads_run: u64,
    dispatches: u64,
}

impl CpuDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(order: ThreadOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    /// Invocations executed so far, including ones that returned immediately.
    pub fn threads_run(&self) -> u64 {
        self.threads_run
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }
}

impl ComputeDispatch for CpuDispatch {
    fn dispatch(
        &mut self,
        program: &GeneratorProgram,
        params: &DgcParams,
        workgroups: u32,
        threads_per_group: u32,
        memory: &dyn DeviceMemory,
    ) -> Result<(), DgcError> {
        let total = workgroups
            .checked_mul(threads_per_group)
            .ok_or(DgcError::InvalidRequest("generator dispatch too large"))?;
        self.dispatches += 1;
        let order = self.order;

        let mut run = |thread_id: u32| -> Result<(), DgcError> {
            self.threads_run += 1;
            program.run_thread(memory, params, thread_id)?;
            Ok(())
        };
        match order {
            ThreadOrder::Forward => (0..total).try_for_each(&mut run),
            ThreadOrder::Reverse => (0..total).rev().try_for_each(&mut run),
        }
    }
}
