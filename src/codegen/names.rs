//! JS identifier mangling.
//!
//! Globals are prefixed with `_` so they cannot collide with names in
//! ordinary JS; locals are prefixed with `$` so they cannot collide with
//! globals. Local mangling must be injective over IR-legal names, since
//! distinct SSA values with distinct names must never share a JS variable.

/// Mangles a global symbol name. Characters outside `[0-9A-Za-z_]` become
/// `_`. Collisions are possible in pathological inputs but do not occur for
/// C-style symbols; a debug-mode uniqueness check lives with the caller.
pub(crate) fn sanitize_global(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    out.push('_');
    for &byte in name.as_bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push('_');
        }
    }
    out
}

/// Mangles a local value name, injectively.
///
/// Valid characters pass through. Every illegal byte is replaced by `$` in
/// place, and encodings are appended at the end of the string: a `.` seen
/// before a later illegal byte contributes a `Z` token, a non-dot illegal
/// byte contributes its two-digit hex code, and dots still pending at the
/// end of the name contribute their own hex code (`2e`). So `x.a` becomes
/// `$x$a2e` and `x..a` becomes `$x$$a2e2e`.
pub(crate) fn sanitize_local(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    let mut suffix = String::new();
    let mut queued_dots = 0usize;
    out.push('$');
    for &byte in name.as_bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            out.push(byte as char);
            continue;
        }
        out.push('$');
        if byte == b'.' {
            queued_dots += 1;
        } else {
            for _ in 0..queued_dots {
                suffix.push('Z');
            }
            queued_dots = 0;
            suffix.push_str(&format!("{:02x}", byte));
        }
    }
    for _ in 0..queued_dots {
        suffix.push_str("2e");
    }
    out.push_str(&suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_get_underscore_prefix_and_replacement() {
        assert_eq!(sanitize_global("main"), "_main");
        assert_eq!(sanitize_global("llvm.memcpy.p0i8"), "_llvm_memcpy_p0i8");
        assert_eq!(sanitize_global("a$b"), "_a_b");
    }

    #[test]
    fn locals_pass_valid_names_through() {
        assert_eq!(sanitize_local("a"), "$a");
        assert_eq!(sanitize_local("retval_3"), "$retval_3");
    }

    #[test]
    fn local_dots_are_hex_escaped_at_end() {
        assert_eq!(sanitize_local("x.a"), "$x$a2e");
        assert_eq!(sanitize_local("x..a"), "$x$$a2e2e");
    }

    #[test]
    fn dots_before_other_illegal_bytes_become_z_tokens() {
        // '#' is 0x23; the earlier dot is recorded as a Z.
        assert_eq!(sanitize_local("x.y#z"), "$x$y$zZ23");
    }

    #[test]
    fn mangling_is_injective_on_lookalikes() {
        let names = ["x.a", "x$a", "x_a", "x..a", "x.$a", "x$.a"];
        let mut seen = std::collections::HashSet::new();
        for name in names {
            assert!(seen.insert(sanitize_local(name)), "collision for {}", name);
        }
    }
}
