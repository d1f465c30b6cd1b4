//! Produces the documented machine-readable JSON schema and strips
//! terminal escape codes from anything that might carry them.

use serde::Serialize;

use crate::codec::DisplayData;
use crate::error_handler::{categorize_exception, categorize_transport, Category, ExceptionRecord};
use crate::kernel_client::{ExecutionResult, ExecutionStatus, Timing};

/// The `error` object embedded in a failed/aborted Execution Result.
#[derive(Debug, Clone, Serialize)]
pub struct OutputError {
    /// Exception class name.
    pub name: String,
    /// Exception message, ANSI-stripped.
    pub message: String,
    /// Error category, e.g. `"import"`.
    pub category: String,
    /// Short human-readable description.
    pub description: String,
    /// Formatted traceback lines, ANSI-stripped.
    pub traceback: Vec<String>,
    /// Deterministic remediation suggestion.
    pub suggestion: String,
}

/// The documented JSON shape for one execution: success, failure, or abort.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    /// `"ok"`, `"error"`, or `"abort"`.
    pub status: &'static str,
    /// The stable numeric code from the Error Handler taxonomy.
    #[serde(rename = "errorCode")]
    pub error_code: u32,
    /// Captured stdout, ANSI-stripped. Always present, possibly empty.
    pub stdout: String,
    /// Captured stderr, ANSI-stripped. Omitted when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Rich display payloads, in arrival order. Omitted when empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub display_data: Vec<DisplayData>,
    /// The classified exception, present only on failure/abort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutputError>,
    /// The kernel's execution counter, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
    /// Wall-clock timing for the call.
    pub timing: Timing,
}

/// Strip ANSI escape sequences, falling back to the original text if the
/// stripped bytes are not valid UTF-8 (should not happen for kernel output).
pub fn strip_ansi(text: &str) -> String {
    let bytes = strip_ansi_escapes::strip(text.as_bytes());
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

/// Build the documented JSON shape from a kernel Execution Result.
pub fn format_execution(result: ExecutionResult) -> ExecutionOutput {
    let stdout = strip_ansi(&result.stdout);
    let stderr = strip_ansi(&result.stderr);

    let (error_code, error) = match (&result.status, &result.error) {
        (ExecutionStatus::Ok, _) => (Category::Success.code(), None),
        (ExecutionStatus::Abort, None) => {
            let classified = categorize_transport("execution was interrupted", true);
            (classified.code, None)
        }
        (_, Some(exc)) => {
            let classified = categorize_exception(&ExceptionRecord {
                ename: &exc.ename,
                evalue: &exc.evalue,
                traceback: &exc.traceback,
            });
            let output_error = OutputError {
                name: exc.ename.clone(),
                message: strip_ansi(&exc.evalue),
                category: classified.category.to_string(),
                description: classified.description.clone(),
                traceback: exc.traceback.iter().map(|line| strip_ansi(line)).collect(),
                suggestion: classified.suggestion.clone(),
            };
            (classified.code, Some(output_error))
        }
        (ExecutionStatus::Error, None) => (Category::Unknown.code(), None),
    };

    let status = match result.status {
        ExecutionStatus::Ok => "ok",
        ExecutionStatus::Error => "error",
        ExecutionStatus::Abort => "abort",
    };

    ExecutionOutput {
        status,
        error_code,
        stdout,
        stderr,
        display_data: result.display_data,
        error,
        execution_count: result.execution_count,
        timing: result.timing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_client::ExecutionError;
    use time::OffsetDateTime;

    fn timing() -> Timing {
        let now = OffsetDateTime::now_utc();
        Timing {
            started: now,
            completed: now,
            duration_ms: 12,
        }
    }

    #[test]
    fn strips_ansi_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    }

    #[test]
    fn success_result_has_zero_error_code_and_no_error_field() {
        let result = ExecutionResult {
            status: ExecutionStatus::Ok,
            stdout: "hi\n".into(),
            stderr: String::new(),
            display_data: vec![],
            error: None,
            execution_count: Some(1),
            timing: timing(),
        };
        let output = format_execution(result);
        assert_eq!(output.status, "ok");
        assert_eq!(output.error_code, 0);
        assert!(output.error.is_none());
    }

    #[test]
    fn module_not_found_maps_to_import_category_and_code() {
        let result = ExecutionResult {
            status: ExecutionStatus::Error,
            stdout: String::new(),
            stderr: String::new(),
            display_data: vec![],
            error: Some(ExecutionError {
                ename: "ModuleNotFoundError".into(),
                evalue: "No module named 'pandas'".into(),
                traceback: vec!["Traceback...".into()],
            }),
            execution_count: Some(2),
            timing: timing(),
        };
        let output = format_execution(result);
        assert_eq!(output.status, "error");
        assert_eq!(output.error_code, 1005);
        let error = output.error.unwrap();
        assert_eq!(error.category, "import");
        assert_eq!(error.suggestion, "pip install pandas");
    }

    #[test]
    fn abort_without_exception_gets_timeout_code() {
        let result = ExecutionResult {
            status: ExecutionStatus::Abort,
            stdout: String::new(),
            stderr: String::new(),
            display_data: vec![],
            error: None,
            execution_count: None,
            timing: timing(),
        };
        let output = format_execution(result);
        assert_eq!(output.status, "abort");
        assert_eq!(output.error_code, 1003);
    }
}
