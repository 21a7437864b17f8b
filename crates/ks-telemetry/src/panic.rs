use std::panic::PanicHookInfo;

/// Route panics from any thread through `tracing::error!`, then run the
/// hook that was installed before (normally the default stderr printer).
///
/// Caught panics (listener callbacks, startup tasks) still pass through the
/// hook, so every one of them leaves a structured log line.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log_panic(info);
        previous(info);
    }));
}

fn log_panic(info: &PanicHookInfo<'_>) {
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let location = info
        .location()
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "<unknown>".to_string());

    tracing::error!(
        thread = thread_name,
        location = %location,
        message = %panic_message(info.payload()),
        "panic"
    );
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string() {
        let err = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "static text");

        let err = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "formatted 42");

        let err = std::panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "non-string panic payload");
    }
}
