use std::time::{Duration, Instant};

/// Which `CSTOMA_REGISTER` body shape to send. Chosen the way
/// `masterconn_sendregister` chooses it: a quick reconnect (within 60s of
/// the last registration) skips resending the full version/timeout
/// negotiation, using the cheaper v2/v3 body; anything else re-sends the
/// full v4 body with this binary's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationVersion {
    V2,
    V3,
    V4,
}

const RECENT_WINDOW: Duration = Duration::from_secs(60);

pub fn select_registration_version(
    last_register: Option<Instant>,
    now: Instant,
    configured_timeout: u16,
) -> RegistrationVersion {
    let recently_registered = last_register
        .map(|t| now.duration_since(t) < RECENT_WINDOW)
        .unwrap_or(false);
    if recently_registered {
        if configured_timeout == 60 {
            RegistrationVersion::V2
        } else {
            RegistrationVersion::V3
        }
    } else {
        RegistrationVersion::V4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_always_uses_v4() {
        let now = Instant::now();
        assert_eq!(select_registration_version(None, now, 60), RegistrationVersion::V4);
    }

    #[test]
    fn quick_reconnect_with_default_timeout_uses_v2() {
        let now = Instant::now();
        let last = now - Duration::from_secs(10);
        assert_eq!(select_registration_version(Some(last), now, 60), RegistrationVersion::V2);
    }

    #[test]
    fn quick_reconnect_with_custom_timeout_uses_v3() {
        let now = Instant::now();
        let last = now - Duration::from_secs(10);
        assert_eq!(select_registration_version(Some(last), now, 30), RegistrationVersion::V3);
    }

    #[test]
    fn stale_last_registration_falls_back_to_v4() {
        let now = Instant::now();
        let last = now - Duration::from_secs(120);
        assert_eq!(select_registration_version(Some(last), now, 60), RegistrationVersion::V4);
    }
}
