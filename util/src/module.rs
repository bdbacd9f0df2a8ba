//! Module interfaces
//!
//! Processing modules in `steer_exec` are driven through the [`State`] trait:
//! initialised once per client session and then processed once per record.

// ---------------------------------------------------------------------------
// MODULE STATE
// ---------------------------------------------------------------------------

/// The internal state of a processing module.
pub trait State {
    /// Data needed to (re)initialise the module
    type InitData;
    type InitError;

    /// Data consumed by one processing cycle
    type InputData;
    /// Data produced by one processing cycle
    type OutputData;
    /// Diagnostics from one processing cycle
    type StatusReport;
    type ProcError;

    /// Initialise the module, discarding any previous state.
    fn init(&mut self, init_data: Self::InitData) -> Result<(), Self::InitError>;

    /// Run one processing cycle.
    ///
    /// An `Err` means the cycle produced no output. Implementations document
    /// whether their state is left untouched in that case.
    fn proc(
        &mut self,
        input_data: &Self::InputData,
    ) -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>;
}
