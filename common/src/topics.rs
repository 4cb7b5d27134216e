use crate::system_info::MacAddress;

/// The MQTT topics of one node, derived from its MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub punch: String,
    pub status: String,
    pub command: String,
}

impl Topics {
    pub fn from_mac(mac_address: &MacAddress) -> Self {
        Self {
            punch: format!("yar/{mac_address}/p"),
            status: format!("yar/{mac_address}/status"),
            command: format!("yar/{mac_address}/cmd"),
        }
    }
}

#[cfg(test)]
mod test_topics {
    use super::*;

    #[test]
    fn test_from_mac() {
        let mac: MacAddress = "abcdef012345".parse().unwrap();
        let topics = Topics::from_mac(&mac);
        assert_eq!(topics.punch, "yar/abcdef012345/p");
        assert_eq!(topics.status, "yar/abcdef012345/status");
        assert_eq!(topics.command, "yar/abcdef012345/cmd");
    }
}
