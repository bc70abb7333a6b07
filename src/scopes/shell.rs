//! Shell hygiene: a pure transform with no external resource.
//!
//! Emits an environment fragment for the caller to `eval`; the inverse
//! fragment is the only revert target, so nothing is ever persisted for
//! this scope.

/// Fragment that disables history and tightens the permission mask.
pub fn hygiene_fragment() -> String {
    "\
unset HISTFILE
export HISTSIZE=0
export HISTFILESIZE=0
export LESSHISTFILE=-
umask 077
"
    .to_string()
}

/// Inverse fragment restoring common interactive-shell defaults.
pub fn restore_fragment() -> String {
    "\
export HISTFILE=\"$HOME/.bash_history\"
export HISTSIZE=1000
export HISTFILESIZE=2000
unset LESSHISTFILE
umask 022
"
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hygiene_fragment_clears_history() {
        let frag = hygiene_fragment();
        assert!(frag.contains("unset HISTFILE"));
        assert!(frag.contains("HISTSIZE=0"));
        assert!(frag.contains("umask 077"));
    }

    #[test]
    fn test_restore_fragment_is_inverse() {
        let frag = restore_fragment();
        assert!(frag.contains("HISTSIZE=1000"));
        assert!(frag.contains("umask 022"));
    }

    #[test]
    fn test_fragments_are_line_oriented() {
        // callers eval these; every line must stand alone
        for frag in [hygiene_fragment(), restore_fragment()] {
            for line in frag.lines() {
                assert!(!line.trim().is_empty());
            }
        }
    }
}
