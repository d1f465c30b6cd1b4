//! Pure mapping from kernel exceptions and transport failures to the small
//! numeric taxonomy the CLI's machine-readable output is built on.

use serde::Serialize;

/// One of the documented error categories. The numeric code is the final
/// authority; never renumber these once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    /// Reply status OK.
    Success,
    /// `SyntaxError`, `IndentationError`.
    Syntax,
    /// Uncategorized Python runtime exceptions.
    Runtime,
    /// Interrupts, readiness timeouts, caller-supplied execution timeouts.
    Timeout,
    /// `MemoryError`, CUDA OOM strings.
    Memory,
    /// `ImportError`, `ModuleNotFoundError`.
    Import,
    /// Filesystem/transport failures, including 502/503/504 from the proxy.
    Io,
    /// Anything that does not match the above.
    Unknown,
}

impl Category {
    /// The numeric code for this category. Codes and categories are a 1:1
    /// map; do not reuse a code for two categories.
    pub fn code(self) -> u32 {
        match self {
            Category::Success => 0,
            Category::Syntax => 1001,
            Category::Runtime => 1002,
            Category::Timeout => 1003,
            Category::Memory => 1004,
            Category::Import => 1005,
            Category::Io => 1006,
            Category::Unknown => 1999,
        }
    }
}

/// The result of classifying a kernel exception or transport failure.
#[derive(Debug, Clone, Serialize)]
pub struct CategorizedError {
    /// The classification category.
    pub category: Category,
    /// The stable numeric code for `category`.
    pub code: u32,
    /// Deterministic, human-suggested remediation.
    pub suggestion: String,
    /// Short human-readable description.
    pub description: String,
}

/// An exception record as reported by the kernel's `execute_reply` or
/// `error` message.
#[derive(Debug, Clone)]
pub struct ExceptionRecord<'a> {
    /// Python exception class name, e.g. `"ZeroDivisionError"`.
    pub ename: &'a str,
    /// Exception message.
    pub evalue: &'a str,
    /// Formatted traceback lines, if any.
    pub traceback: &'a [String],
}

const SYNTAX_NAMES: &[&str] = &["SyntaxError", "IndentationError"];
const IMPORT_NAMES: &[&str] = &["ImportError", "ModuleNotFoundError"];

/// Classify a kernel exception into a category with a deterministic
/// suggestion.
pub fn categorize_exception(exc: &ExceptionRecord<'_>) -> CategorizedError {
    if exc.ename == "KeyboardInterrupt" {
        return CategorizedError {
            category: Category::Timeout,
            code: Category::Timeout.code(),
            suggestion: "the call was interrupted; retry if this was unexpected".into(),
            description: "execution was interrupted".into(),
        };
    }

    if SYNTAX_NAMES.contains(&exc.ename) {
        return CategorizedError {
            category: Category::Syntax,
            code: Category::Syntax.code(),
            suggestion: "fix the syntax error and resubmit".into(),
            description: format!("{}: {}", exc.ename, exc.evalue),
        };
    }

    if exc.ename == "MemoryError" || exc.evalue.contains("CUDA out of memory") || exc.evalue.contains("out of memory") {
        return CategorizedError {
            category: Category::Memory,
            code: Category::Memory.code(),
            suggestion: "reduce memory usage or request a runtime with more memory".into(),
            description: format!("{}: {}", exc.ename, exc.evalue),
        };
    }

    if IMPORT_NAMES.contains(&exc.ename) {
        let module = extract_module_name(exc.evalue);
        let suggestion = match &module {
            Some(name) => format!("pip install {name}"),
            None => "install the missing module".into(),
        };
        return CategorizedError {
            category: Category::Import,
            code: Category::Import.code(),
            suggestion,
            description: format!("{}: {}", exc.ename, exc.evalue),
        };
    }

    if matches!(exc.ename, "FileNotFoundError" | "PermissionError") {
        return CategorizedError {
            category: Category::Io,
            code: Category::Io.code(),
            suggestion: "check the file path and permissions on the runtime".into(),
            description: format!("{}: {}", exc.ename, exc.evalue),
        };
    }

    if matches!(
        exc.ename,
        "NameError"
            | "TypeError"
            | "ValueError"
            | "AttributeError"
            | "ZeroDivisionError"
            | "IndexError"
            | "KeyError"
    ) {
        return CategorizedError {
            category: Category::Runtime,
            code: Category::Runtime.code(),
            suggestion: "inspect the traceback and fix the offending code".into(),
            description: format!("{}: {}", exc.ename, exc.evalue),
        };
    }

    CategorizedError {
        category: Category::Unknown,
        code: Category::Unknown.code(),
        suggestion: "inspect the traceback for details".into(),
        description: format!("{}: {}", exc.ename, exc.evalue),
    }
}

/// Classify a transport-level failure (connection refused, proxy gateway
/// errors, readiness timeout, reconnect exhaustion).
pub fn categorize_transport(description: impl Into<String>, timeout: bool) -> CategorizedError {
    let description = description.into();
    if timeout {
        CategorizedError {
            category: Category::Timeout,
            code: Category::Timeout.code(),
            suggestion: "retry, or request a fresh runtime with --new-runtime".into(),
            description,
        }
    } else {
        CategorizedError {
            category: Category::Io,
            code: Category::Io.code(),
            suggestion: "retry, or request a fresh runtime with --new-runtime".into(),
            description,
        }
    }
}

/// Extract a best-guess module name from a `ModuleNotFoundError`/`ImportError`
/// message such as `"No module named 'pandas'"`.
fn extract_module_name(evalue: &str) -> Option<String> {
    let start = evalue.find('\'')?;
    let rest = &evalue[start + 1..];
    let end = rest.find('\'')?;
    let name = &rest[..end];
    name.split('.').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exc<'a>(ename: &'a str, evalue: &'a str) -> ExceptionRecord<'a> {
        ExceptionRecord {
            ename,
            evalue,
            traceback: &[],
        }
    }

    #[test]
    fn categorizes_syntax_error() {
        let result = categorize_exception(&exc("SyntaxError", "invalid syntax"));
        assert_eq!(result.category, Category::Syntax);
        assert_eq!(result.code, 1001);
    }

    #[test]
    fn categorizes_zero_division_as_runtime() {
        let result = categorize_exception(&exc("ZeroDivisionError", "division by zero"));
        assert_eq!(result.category, Category::Runtime);
        assert_eq!(result.code, 1002);
    }

    #[test]
    fn derives_pip_install_suggestion_from_module_name() {
        let result = categorize_exception(&exc("ModuleNotFoundError", "No module named 'pandas'"));
        assert_eq!(result.category, Category::Import);
        assert_eq!(result.suggestion, "pip install pandas");
    }

    #[test]
    fn derives_module_name_for_submodule_import() {
        assert_eq!(
            extract_module_name("No module named 'foo.bar'"),
            Some("foo".to_string())
        );
    }

    #[test]
    fn categorizes_keyboard_interrupt_as_timeout() {
        let result = categorize_exception(&exc("KeyboardInterrupt", ""));
        assert_eq!(result.category, Category::Timeout);
        assert_eq!(result.code, 1003);
    }

    #[test]
    fn categorizes_cuda_oom_as_memory() {
        let result = categorize_exception(&exc("RuntimeError", "CUDA out of memory."));
        assert_eq!(result.category, Category::Memory);
    }

    #[test]
    fn falls_back_to_unknown() {
        let result = categorize_exception(&exc("WeirdCustomError", "???"));
        assert_eq!(result.category, Category::Unknown);
        assert_eq!(result.code, 1999);
    }

    #[test]
    fn all_codes_are_documented_and_unique() {
        let codes: Vec<u32> = [
            Category::Success,
            Category::Syntax,
            Category::Runtime,
            Category::Timeout,
            Category::Memory,
            Category::Import,
            Category::Io,
            Category::Unknown,
        ]
        .into_iter()
        .map(Category::code)
        .collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(codes.len(), sorted.len());
    }
}
