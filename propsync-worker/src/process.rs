//! Operator-visible process labels (`ps`, `top`).

/// `propsync-supervisor`, `propsync-worker-3`, ...
pub fn label(role: &str, slot: Option<usize>) -> String {
    match slot {
        Some(slot) => format!("propsync-{role}-{slot}"),
        None => format!("propsync-{role}"),
    }
}

/// Set the thread/process name. Linux keeps only the first 15 bytes.
pub fn set_process_label(role: &str, slot: Option<usize>) -> String {
    let label = label(role, slot);
    apply(&label);
    label
}

#[cfg(target_os = "linux")]
fn apply(label: &str) {
    let name = match std::ffi::CString::new(label) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(%label, error = %e, "invalid process label");
            return;
        }
    };
    if let Err(errno) = nix::sys::prctl::set_name(&name) {
        tracing::debug!(%label, %errno, "failed to set process name");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply(label: &str) {
    tracing::debug!(%label, "process naming unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_role_and_slot() {
        assert_eq!(label("supervisor", None), "propsync-supervisor");
        assert_eq!(label("worker", Some(3)), "propsync-worker-3");
    }
}
