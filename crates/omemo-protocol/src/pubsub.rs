//! Publish/subscribe requests and the two OMEMO node payloads: the
//! per-account device list and the per-device bundle.

use std::collections::BTreeSet;

use omemo_crypto::{PreKeyBundle, PublicPreKey};

use crate::element::Element;
use crate::error::ProtocolError;
use crate::stanza::Iq;

/// Legacy OMEMO namespace shared with deployed clients.
pub const NS_OMEMO: &str = "eu.siacs.conversations.axolotl";
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// Id of the single item kept on each node.
const CURRENT_ITEM: &str = "current";

/// Shared device-list node of an account.
pub fn devicelist_node() -> String {
    format!("{NS_OMEMO}.devicelist")
}

/// Bundle node of one device.
pub fn bundle_node(device_id: u32) -> String {
    format!("{NS_OMEMO}.bundles:{device_id}")
}

/// Publish `item` as the current item of our own `node`.
pub fn publish_request(node: &str, item: Element) -> Iq {
    Iq::set(
        None,
        Element::with_namespace("pubsub", NS_PUBSUB).child(
            Element::new("publish")
                .attr("node", node)
                .child(Element::new("item").attr("id", CURRENT_ITEM).child(item)),
        ),
    )
}

/// Fetch the current item of `node` on `owner` (`None` = our own account).
pub fn items_request(owner: Option<&str>, node: &str) -> Iq {
    Iq::get(
        owner,
        Element::with_namespace("pubsub", NS_PUBSUB)
            .child(Element::new("items").attr("node", node).attr("max_items", 1)),
    )
}

/// Extract the payload of the first item from an items response.
/// An empty node yields `None`.
pub fn parse_items_response(response: &Iq) -> Result<Option<Element>, ProtocolError> {
    let Some(pubsub) = &response.payload else {
        return Ok(None);
    };
    let items = pubsub.required("items")?;
    Ok(items
        .find("item")
        .and_then(|item| item.children.first())
        .cloned())
}

pub fn device_list_element(device_ids: &BTreeSet<u32>) -> Element {
    device_ids.iter().fold(
        Element::with_namespace("list", NS_OMEMO),
        |list, id| list.child(Element::new("device").attr("id", id)),
    )
}

pub fn parse_device_list(list: &Element) -> Result<BTreeSet<u32>, ProtocolError> {
    if !list.is("list", NS_OMEMO) {
        return Err(ProtocolError::Malformed(format!(
            "expected device list, got <{}>",
            list.name
        )));
    }
    list.find_all("device")
        .map(|device| device.parse_attr::<u32>("id"))
        .collect()
}

pub fn bundle_element(bundle: &PreKeyBundle) -> Element {
    let prekeys = bundle.prekeys.iter().fold(Element::new("prekeys"), |prekeys, pk| {
        prekeys.child(
            Element::new("preKeyPublic")
                .attr("preKeyId", pk.id)
                .base64(&pk.public),
        )
    });

    Element::with_namespace("bundle", NS_OMEMO)
        .child(
            Element::new("signedPreKeyPublic")
                .attr("signedPreKeyId", bundle.signed_prekey_id)
                .base64(&bundle.signed_prekey),
        )
        .child(Element::new("signedPreKeySignature").base64(&bundle.signed_prekey_signature))
        .child(Element::new("identityKey").base64(&bundle.identity_key))
        .child(prekeys)
}

/// Parse a published bundle. Every part is required: identity key, signed
/// prekey with id and signature, and at least one one-time prekey.
pub fn parse_bundle(bundle: &Element) -> Result<PreKeyBundle, ProtocolError> {
    if !bundle.is("bundle", NS_OMEMO) {
        return Err(ProtocolError::Malformed(format!(
            "expected bundle, got <{}>",
            bundle.name
        )));
    }
    let signed = bundle.required("signedPreKeyPublic")?;
    let prekeys = bundle
        .required("prekeys")?
        .find_all("preKeyPublic")
        .map(|pk| {
            Ok(PublicPreKey {
                id: pk.parse_attr("preKeyId")?,
                public: pk.base64_text()?,
            })
        })
        .collect::<Result<Vec<_>, ProtocolError>>()?;
    if prekeys.is_empty() {
        return Err(ProtocolError::Malformed("bundle has no one-time prekeys".into()));
    }

    Ok(PreKeyBundle {
        identity_key: bundle.required("identityKey")?.base64_text()?,
        signed_prekey_id: signed.parse_attr("signedPreKeyId")?,
        signed_prekey: signed.base64_text()?,
        signed_prekey_signature: bundle.required("signedPreKeySignature")?.base64_text()?,
        prekeys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::IqKind;

    fn sample_bundle() -> PreKeyBundle {
        PreKeyBundle {
            identity_key: vec![1; 32],
            signed_prekey_id: 1,
            signed_prekey: vec![2; 32],
            signed_prekey_signature: vec![3; 64],
            prekeys: vec![
                PublicPreKey { id: 1, public: vec![4; 32] },
                PublicPreKey { id: 2, public: vec![5; 32] },
            ],
        }
    }

    #[test]
    fn node_names() {
        assert_eq!(devicelist_node(), "eu.siacs.conversations.axolotl.devicelist");
        assert_eq!(bundle_node(42), "eu.siacs.conversations.axolotl.bundles:42");
    }

    #[test]
    fn bundle_element_parses_back() {
        let bundle = sample_bundle();
        assert_eq!(parse_bundle(&bundle_element(&bundle)).unwrap(), bundle);
    }

    #[test]
    fn bundle_without_identity_key_rejected() {
        let mut el = bundle_element(&sample_bundle());
        el.children.retain(|c| c.name != "identityKey");
        assert!(parse_bundle(&el).is_err());
    }

    #[test]
    fn bundle_without_signature_rejected() {
        let mut el = bundle_element(&sample_bundle());
        el.children.retain(|c| c.name != "signedPreKeySignature");
        assert!(parse_bundle(&el).is_err());
    }

    #[test]
    fn bundle_without_prekeys_rejected() {
        let mut bundle = sample_bundle();
        bundle.prekeys.clear();
        assert!(parse_bundle(&bundle_element(&bundle)).is_err());
    }

    #[test]
    fn signed_prekey_without_id_rejected() {
        let mut el = bundle_element(&sample_bundle());
        for child in &mut el.children {
            if child.name == "signedPreKeyPublic" {
                child.attrs.clear();
            }
        }
        assert!(parse_bundle(&el).is_err());
    }

    #[test]
    fn device_list_roundtrip_and_validation() {
        let ids: BTreeSet<u32> = [5, 7, 9].into_iter().collect();
        assert_eq!(parse_device_list(&device_list_element(&ids)).unwrap(), ids);

        let bad = Element::with_namespace("list", NS_OMEMO)
            .child(Element::new("device").attr("id", "seven"));
        assert!(parse_device_list(&bad).is_err());
    }

    #[test]
    fn items_response_extracts_first_payload() {
        let request = items_request(Some("b@example.org"), &devicelist_node());
        let list = device_list_element(&[11].into_iter().collect());
        let response = request.reply(
            IqKind::Result,
            Some(
                Element::with_namespace("pubsub", NS_PUBSUB).child(
                    Element::new("items")
                        .attr("node", devicelist_node())
                        .child(Element::new("item").attr("id", "current").child(list.clone())),
                ),
            ),
        );
        assert_eq!(parse_items_response(&response).unwrap(), Some(list));
    }
}
