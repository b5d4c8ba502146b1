pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
pub const INPUT_ERROR: i32 = 2;

/// Invalid arguments and unreadable configuration are input errors;
/// everything that fails once streaming has started is an execution error.
pub fn for_error(error: &sdca_dsp::DspError) -> i32 {
    match error {
        sdca_dsp::DspError::InvalidParameter(_) => INPUT_ERROR,
        _ => EXECUTION_ERROR,
    }
}
