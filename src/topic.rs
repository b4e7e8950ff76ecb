//! Wire topic names.

/// Properties travelling to a thing (`/a/t/{thing}/e/i`).
pub fn thing_inbound(thing_id: &str) -> String {
    format!("/a/t/{}/e/i", thing_id)
}

/// Properties published by a thing (`/a/t/{thing}/e/o`).
pub fn thing_outbound(thing_id: &str) -> String {
    format!("/a/t/{}/e/o", thing_id)
}

/// Raw monitor input of a device.
pub fn monitor_inbound(device_id: &str) -> String {
    format!("/a/d/{}/s/i", device_id)
}

/// Raw monitor output of a device.
pub fn monitor_outbound(device_id: &str) -> String {
    format!("/a/d/{}/s/o", device_id)
}

/// Where the cloud announces the thing a device is attached to.
pub fn device_association(device_id: &str) -> String {
    format!("/a/d/{}/e/i", device_id)
}

/// Monitor output carries plain text rather than a property batch.
pub fn is_monitor_output(topic: &str) -> bool {
    topic.ends_with("/s/o")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(thing_inbound("t1"), "/a/t/t1/e/i");
        assert_eq!(thing_outbound("t1"), "/a/t/t1/e/o");
        assert_eq!(monitor_inbound("d1"), "/a/d/d1/s/i");
        assert_eq!(monitor_outbound("d1"), "/a/d/d1/s/o");
        assert_eq!(device_association("d1"), "/a/d/d1/e/i");
    }

    #[test]
    fn only_monitor_output_is_raw() {
        assert!(is_monitor_output(&monitor_outbound("d1")));
        assert!(!is_monitor_output(&monitor_inbound("d1")));
        assert!(!is_monitor_output(&thing_outbound("t1")));
        assert!(!is_monitor_output(&device_association("d1")));
    }
}
