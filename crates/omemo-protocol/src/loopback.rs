//! In-memory network: routes messages between connected accounts and answers
//! publish/subscribe requests from its own node table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::element::Element;
use crate::error::ProtocolError;
use crate::pubsub::NS_PUBSUB;
use crate::stanza::{bare_address, Iq, IqKind, Stanza, Transport};

#[derive(Default)]
struct Hub {
    /// Every live connection of each bare account.
    clients: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Stanza>>>>,
    /// Current item per (owner, node).
    nodes: Mutex<HashMap<(String, String), Element>>,
    drop_iq_replies: AtomicBool,
}

/// Shared handle to one in-memory network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Hub>,
}

/// One account's connection to a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    account: String,
    inbound: mpsc::UnboundedSender<Stanza>,
    hub: Arc<Hub>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for `account`. Messages addressed to the account
    /// reach every open connection; request replies reach only the sender.
    pub fn connect(&self, account: &str) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<Stanza>) {
        let account = bare_address(account);
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .clients
            .lock()
            .entry(account.clone())
            .or_default()
            .push(tx.clone());
        tracing::debug!(account = %account, "loopback connection opened");
        let transport = LoopbackTransport {
            account,
            inbound: tx,
            hub: Arc::clone(&self.hub),
        };
        (Arc::new(transport), rx)
    }

    /// While set, requests are processed but their replies are discarded.
    pub fn set_drop_iq_replies(&self, drop: bool) {
        self.hub.drop_iq_replies.store(drop, Ordering::SeqCst);
    }

    pub fn node_item(&self, owner: &str, node: &str) -> Option<Element> {
        self.hub
            .nodes
            .lock()
            .get(&(bare_address(owner), node.to_string()))
            .cloned()
    }

    pub fn set_node_item(&self, owner: &str, node: &str, item: Element) {
        self.hub
            .nodes
            .lock()
            .insert((bare_address(owner), node.to_string()), item);
    }

    pub fn remove_node(&self, owner: &str, node: &str) {
        self.hub
            .nodes
            .lock()
            .remove(&(bare_address(owner), node.to_string()));
    }
}

impl Hub {
    fn deliver(&self, account: &str, stanza: &Stanza) -> usize {
        let mut clients = self.clients.lock();
        let Some(connections) = clients.get_mut(account) else {
            return 0;
        };
        connections.retain(|tx| tx.send(stanza.clone()).is_ok());
        connections.len()
    }

    fn handle_request(&self, sender: &str, iq: &Iq) -> Iq {
        let owner = iq.to.as_deref().map_or_else(|| sender.to_string(), bare_address);
        let mut reply = match &iq.payload {
            Some(pubsub) if pubsub.is("pubsub", NS_PUBSUB) => self.handle_pubsub(sender, &owner, iq, pubsub),
            _ => error_reply(iq, "feature-not-implemented"),
        };
        reply.from = Some(owner);
        reply.to = Some(sender.to_string());
        reply
    }

    fn handle_pubsub(&self, sender: &str, owner: &str, iq: &Iq, pubsub: &Element) -> Iq {
        if let Some(publish) = pubsub.find("publish") {
            if owner != sender {
                return error_reply(iq, "forbidden");
            }
            let (Some(node), Some(item)) = (
                publish.get_attr("node"),
                publish.find("item").and_then(|item| item.children.first()),
            ) else {
                return error_reply(iq, "bad-request");
            };
            self.nodes
                .lock()
                .insert((owner.to_string(), node.to_string()), item.clone());
            return iq.reply(IqKind::Result, None);
        }

        if let Some(items) = pubsub.find("items") {
            let Some(node) = items.get_attr("node") else {
                return error_reply(iq, "bad-request");
            };
            let Some(item) = self
                .nodes
                .lock()
                .get(&(owner.to_string(), node.to_string()))
                .cloned()
            else {
                return error_reply(iq, "item-not-found");
            };
            return iq.reply(
                IqKind::Result,
                Some(
                    Element::with_namespace("pubsub", NS_PUBSUB).child(
                        Element::new("items")
                            .attr("node", node)
                            .child(Element::new("item").attr("id", "current").child(item)),
                    ),
                ),
            );
        }

        error_reply(iq, "bad-request")
    }
}

fn error_reply(iq: &Iq, condition: &str) -> Iq {
    iq.reply(
        IqKind::Error {
            condition: condition.to_string(),
        },
        None,
    )
}

impl LoopbackTransport {
    pub fn account(&self) -> &str {
        &self.account
    }
}

/// Stanzas cross the network in serialized form, as they would on a socket.
fn through_wire(stanza: &Stanza) -> Result<Stanza, ProtocolError> {
    let encoded = serde_json::to_vec(stanza)
        .map_err(|e| ProtocolError::Transport(format!("encode stanza: {e}")))?;
    serde_json::from_slice(&encoded)
        .map_err(|e| ProtocolError::Transport(format!("decode stanza: {e}")))
}

impl Transport for LoopbackTransport {
    fn send(&self, stanza: Stanza) -> Result<(), ProtocolError> {
        match through_wire(&stanza)? {
            Stanza::Message(mut message) => {
                message.from = Some(self.account.clone());
                let to = bare_address(&message.to);
                let delivered = self.hub.deliver(&to, &Stanza::Message(message));
                if delivered == 0 {
                    tracing::debug!(to = %to, "no live connection for recipient; message dropped");
                }
                Ok(())
            }
            Stanza::Iq(iq) if iq.is_response() => {
                tracing::debug!(request_id = %iq.id, "ignoring unsolicited response");
                Ok(())
            }
            Stanza::Iq(mut iq) => {
                iq.from = Some(self.account.clone());
                let reply = self.hub.handle_request(&self.account, &iq);
                if self.hub.drop_iq_replies.load(Ordering::SeqCst) {
                    tracing::debug!(request_id = %iq.id, "dropping reply");
                    return Ok(());
                }
                self.inbound
                    .send(Stanza::Iq(reply))
                    .map_err(|_| ProtocolError::Transport("connection closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{devicelist_node, items_request, publish_request};
    use crate::stanza::Message;

    fn reply(rx: &mut mpsc::UnboundedReceiver<Stanza>) -> Iq {
        match rx.try_recv().unwrap() {
            Stanza::Iq(iq) => iq,
            other => panic!("expected iq, got {other:?}"),
        }
    }

    #[test]
    fn publish_then_fetch_from_another_account() {
        let net = LoopbackNetwork::new();
        let (a, mut a_rx) = net.connect("a@example.org");
        let (b, mut b_rx) = net.connect("b@example.org/laptop");

        let list = Element::new("list");
        b.send(Stanza::Iq(publish_request(&devicelist_node(), list.clone())))
            .unwrap();
        assert_eq!(reply(&mut b_rx).kind, IqKind::Result);

        a.send(Stanza::Iq(items_request(Some("b@example.org"), &devicelist_node())))
            .unwrap();
        let response = reply(&mut a_rx);
        assert_eq!(response.from.as_deref(), Some("b@example.org"));
        let item = crate::pubsub::parse_items_response(&response).unwrap();
        assert_eq!(item, Some(list));
    }

    #[test]
    fn missing_node_is_item_not_found() {
        let net = LoopbackNetwork::new();
        let (a, mut a_rx) = net.connect("a@example.org");
        a.send(Stanza::Iq(items_request(Some("c@example.org"), &devicelist_node())))
            .unwrap();
        assert_eq!(
            reply(&mut a_rx).kind,
            IqKind::Error {
                condition: "item-not-found".into()
            }
        );
    }

    #[test]
    fn removed_node_is_gone() {
        let net = LoopbackNetwork::new();
        let (a, mut a_rx) = net.connect("a@example.org");
        net.set_node_item("b@example.org", &devicelist_node(), Element::new("list"));
        net.remove_node("b@example.org", &devicelist_node());

        a.send(Stanza::Iq(items_request(Some("b@example.org"), &devicelist_node())))
            .unwrap();
        assert!(matches!(reply(&mut a_rx).kind, IqKind::Error { .. }));
        assert_eq!(a.account(), "a@example.org");
    }

    #[test]
    fn cannot_publish_to_other_accounts() {
        let net = LoopbackNetwork::new();
        let (a, mut a_rx) = net.connect("a@example.org");
        let mut iq = publish_request(&devicelist_node(), Element::new("list"));
        iq.to = Some("b@example.org".into());
        a.send(Stanza::Iq(iq)).unwrap();
        assert!(matches!(reply(&mut a_rx).kind, IqKind::Error { .. }));
        assert!(net.node_item("b@example.org", &devicelist_node()).is_none());
    }

    #[test]
    fn messages_reach_every_connection_of_the_account() {
        let net = LoopbackNetwork::new();
        let (a, _a_rx) = net.connect("a@example.org");
        let (_b1, mut b1_rx) = net.connect("b@example.org");
        let (_b2, mut b2_rx) = net.connect("b@example.org");

        let mut msg = Message::chat("B@example.org");
        msg.body = Some("hello".into());
        a.send(Stanza::Message(msg)).unwrap();

        for rx in [&mut b1_rx, &mut b2_rx] {
            let Stanza::Message(received) = rx.try_recv().unwrap() else {
                panic!("expected message");
            };
            assert_eq!(received.from.as_deref(), Some("a@example.org"));
            assert_eq!(received.body.as_deref(), Some("hello"));
        }
    }

    #[test]
    fn dropped_replies_still_apply_the_request() {
        let net = LoopbackNetwork::new();
        let (a, mut a_rx) = net.connect("a@example.org");
        net.set_drop_iq_replies(true);
        a.send(Stanza::Iq(publish_request(&devicelist_node(), Element::new("list"))))
            .unwrap();
        assert!(a_rx.try_recv().is_err());
        assert!(net.node_item("a@example.org", &devicelist_node()).is_some());
    }
}
