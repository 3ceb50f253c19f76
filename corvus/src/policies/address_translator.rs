use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::errors::TranslationError;

/// Informations about a peer, passed to the translator together with the
/// address broadcast by the node itself.
#[derive(Debug, Clone, Copy)]
pub struct UntranslatedPeer<'a> {
    pub host_id: uuid::Uuid,
    pub untranslated_address: SocketAddr,
    pub datacenter: Option<&'a str>,
    pub rack: Option<&'a str>,
}

/// Maps addresses broadcast by nodes to addresses the driver can actually
/// reach, for deployments behind NAT or proxies.
///
/// Only addresses learnt from the cluster's own metadata are translated;
/// user-supplied contact points are used verbatim.
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn translate_address(
        &self,
        peer: &UntranslatedPeer<'_>,
    ) -> Result<SocketAddr, TranslationError>;
}

/// A static translation table from broadcast address to routable address.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressTranslator {
    translation_map: HashMap<SocketAddr, SocketAddr>,
}

impl StaticAddressTranslator {
    pub fn new(translation_map: HashMap<SocketAddr, SocketAddr>) -> Self {
        Self { translation_map }
    }
}

#[async_trait]
impl AddressTranslator for StaticAddressTranslator {
    async fn translate_address(
        &self,
        peer: &UntranslatedPeer<'_>,
    ) -> Result<SocketAddr, TranslationError> {
        self.translation_map
            .get(&peer.untranslated_address)
            .copied()
            .ok_or(TranslationError::NoRuleForAddress(
                peer.untranslated_address,
            ))
    }
}

#[async_trait]
impl AddressTranslator for HashMap<SocketAddr, SocketAddr> {
    async fn translate_address(
        &self,
        peer: &UntranslatedPeer<'_>,
    ) -> Result<SocketAddr, TranslationError> {
        self.get(&peer.untranslated_address)
            .copied()
            .ok_or(TranslationError::NoRuleForAddress(
                peer.untranslated_address,
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn static_translator_maps_known_addresses() {
        let mut map = HashMap::new();
        let broadcast: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let routable: SocketAddr = "198.51.100.7:31042".parse().unwrap();
        map.insert(broadcast, routable);
        let translator = StaticAddressTranslator::new(map);

        let peer = UntranslatedPeer {
            host_id: Uuid::new_v4(),
            untranslated_address: broadcast,
            datacenter: None,
            rack: None,
        };
        assert_eq!(translator.translate_address(&peer).await.unwrap(), routable);

        let unknown = UntranslatedPeer {
            untranslated_address: "10.0.0.2:9042".parse().unwrap(),
            ..peer
        };
        assert!(translator.translate_address(&unknown).await.is_err());
    }
}
