//! Static pre-execution source screening.
//!
//! Plugins may ship the source text their entry point was built from; the
//! screen rejects source referencing dynamic code evaluation, raw process
//! or host-global access, and filesystem or process-spawn primitives. This
//! is a pragmatic first line, not hard isolation; see the crate docs.

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::error::{RuntimeError, RuntimeResult};

/// Denylisted construct patterns, paired with the labels reported back.
const UNSAFE_CONSTRUCTS: &[(&str, &str)] = &[
    (r"\beval\s*\(", "dynamic code evaluation (eval)"),
    (r"\bnew\s+Function\s*\(", "dynamic code evaluation (Function constructor)"),
    (r"\bFunction\s*\(", "dynamic code evaluation (Function call)"),
    (r"\brequire\s*\(", "dynamic module loading (require)"),
    (r"\bimport\s*\(", "dynamic module loading (import)"),
    (r"\bprocess\.", "raw process access"),
    (r"\bglobalThis\b", "host-global access"),
    (r"\bchild_process\b", "process spawning"),
    (r"\bspawn\s*\(", "process spawning"),
    (r"\bexecSync\s*\(", "process spawning"),
    (r"\bfs\.", "filesystem access"),
    (r"\b__proto__\b", "prototype tampering"),
    (r"\bDeno\.", "host-global access"),
];

static UNSAFE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(UNSAFE_CONSTRUCTS.iter().map(|(pattern, _)| *pattern)).unwrap()
});

/// Reject source text referencing any denylisted construct.
///
/// Returns the first matching construct's label in the error so an admin
/// surface can say what was rejected without echoing plugin source.
pub fn screen_source(source: &str) -> RuntimeResult<()> {
    if let Some(index) = UNSAFE_PATTERNS.matches(source).iter().next() {
        let (_, label) = UNSAFE_CONSTRUCTS[index];
        return Err(RuntimeError::UnsafeCodePattern(label.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_passes() {
        screen_source("function main(input) { return { doubled: input.value * 2 }; }").unwrap();
    }

    #[test]
    fn test_eval_is_rejected() {
        let err = screen_source("return eval('1+1');").unwrap_err();
        match err {
            RuntimeError::UnsafeCodePattern(label) => assert!(label.contains("eval")),
            other => panic!("expected UnsafeCodePattern, got {other:?}"),
        }
    }

    #[test]
    fn test_process_access_is_rejected() {
        assert!(screen_source("const home = process.env.HOME;").is_err());
    }

    #[test]
    fn test_filesystem_access_is_rejected() {
        assert!(screen_source("fs.readFileSync('/etc/passwd')").is_err());
    }

    #[test]
    fn test_spawn_is_rejected() {
        assert!(screen_source("spawn('sh', ['-c', 'id'])").is_err());
        assert!(screen_source("const cp = child_process;").is_err());
    }

    #[test]
    fn test_proto_tampering_is_rejected() {
        assert!(screen_source("target.__proto__.polluted = true;").is_err());
    }

    #[test]
    fn test_identifier_containing_keyword_passes() {
        // "evaluate" must not trip the eval pattern.
        screen_source("function evaluate(x) { return x; } evaluate(1)").unwrap();
    }
}
