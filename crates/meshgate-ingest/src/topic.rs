//! Topic grammar parsing (§4.C):
//! `<root>/<region>/<subregion>?/<modem-preset>?/<channel-type>/<channel-name>?/<gateway-id>?`
//!
//! `<subregion>` and `<modem-preset>` are optional and of unknown length,
//! so the parser locates the channel-type segment by scanning for one of
//! the known markers rather than assuming a fixed position.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// `/e/` — envelope with encrypted (or occasionally plaintext) inner packet.
    Envelope,
    /// `/c/` — channel-encrypted JSON payload.
    Channel,
    /// `/stat/` — JSON device stats, gateway id trailing.
    Stat,
    /// `/map/` — JSON position or raw map-report.
    Map,
    /// `/json/` (optionally preceded by a bare modem-preset segment like `2`).
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub channel_type: ChannelType,
    pub channel_name: Option<String>,
    pub gateway_id: Option<String>,
}

fn marker(segment: &str) -> Option<ChannelType> {
    match segment {
        "e" => Some(ChannelType::Envelope),
        "c" => Some(ChannelType::Channel),
        "stat" => Some(ChannelType::Stat),
        "map" => Some(ChannelType::Map),
        "json" => Some(ChannelType::Json),
        _ => None,
    }
}

/// Parse a topic into its category, channel name (when applicable), and
/// gateway id (when the trailing segment looks like a `!xxxxxxxx` node id).
pub fn parse_topic(topic: &str) -> Option<ParsedTopic> {
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return None;
    }

    let (ct_idx, channel_type) = segments
        .iter()
        .enumerate()
        .skip(1) // root
        .find_map(|(i, s)| marker(s).map(|ct| (i, ct)))?;

    let rest = &segments[ct_idx + 1..];
    let (channel_name, gateway_id) = match channel_type {
        ChannelType::Envelope | ChannelType::Channel => {
            let channel_name = rest.first().map(|s| s.to_string());
            let gateway_id = rest.get(1).map(|s| s.to_string());
            (channel_name, gateway_id)
        }
        ChannelType::Stat => {
            let gateway_id = rest.last().map(|s| s.to_string());
            (None, gateway_id)
        }
        ChannelType::Map | ChannelType::Json => {
            let gateway_id = rest
                .last()
                .filter(|s| s.starts_with('!'))
                .map(|s| s.to_string());
            let channel_name = rest.first().filter(|s| !s.starts_with('!')).map(|s| s.to_string());
            (channel_name, gateway_id)
        }
    };

    Some(ParsedTopic {
        channel_type,
        channel_name,
        gateway_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_channel_envelope_topic() {
        let parsed = parse_topic("msh/US/2/e/LongFast/!abcdef00").unwrap();
        assert_eq!(parsed.channel_type, ChannelType::Envelope);
        assert_eq!(parsed.channel_name.as_deref(), Some("LongFast"));
        assert_eq!(parsed.gateway_id.as_deref(), Some("!abcdef00"));
    }

    #[test]
    fn parses_stat_topic_gateway_trailing() {
        let parsed = parse_topic("msh/US/2/stat/!abcdef00").unwrap();
        assert_eq!(parsed.channel_type, ChannelType::Stat);
        assert_eq!(parsed.gateway_id.as_deref(), Some("!abcdef00"));
    }

    #[test]
    fn parses_channel_json_topic() {
        let parsed = parse_topic("msh/US/2/c/LongFast").unwrap();
        assert_eq!(parsed.channel_type, ChannelType::Channel);
        assert_eq!(parsed.channel_name.as_deref(), Some("LongFast"));
    }

    #[test]
    fn parses_json_with_leading_modem_preset_segment() {
        let parsed = parse_topic("msh/US/2/json/!abcdef00").unwrap();
        assert_eq!(parsed.channel_type, ChannelType::Json);
        assert_eq!(parsed.gateway_id.as_deref(), Some("!abcdef00"));
    }

    #[test]
    fn too_short_topic_rejected() {
        assert!(parse_topic("msh/US").is_none());
    }

    #[test]
    fn unknown_channel_type_rejected() {
        assert!(parse_topic("msh/US/2/bogus/x").is_none());
    }
}
