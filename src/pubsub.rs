//! XEP-0060 publish-subscribe operations (C6), built on top of the
//! request/response engine in [`crate::event_loop`].
//!
//! Grounded on `kimberlite-server/src/handler.rs`'s pattern of building a
//! request, sending it through the shared engine, and mapping the
//! engine's result into a domain-specific outcome — generalized here from
//! one big dispatch `match` to one method per pubsub operation, each
//! building its own stanza and decoding its own response shape.

use std::sync::Arc;

use tracing::instrument;

use crate::decoder::{self, Shape};
use crate::error::{ClientError, ClientResult};
use crate::event_loop::EventLoop;
use crate::model::{
    Affiliation, AffiliationEntry, CollectionEntry, Meta, NodeType, PacketVariant, Reference,
    ReferenceKind, Response, Schedule, ScheduleEvent, Stanza, Subscription,
};

const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";
const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
const NS_DATA_FORMS: &str = "jabber:x:data";

pub(crate) fn domain_of(jid: &str) -> ClientResult<&str> {
    jid.split_once('@')
        .map(|(_, domain)| domain.split('/').next().unwrap_or(domain))
        .ok_or_else(|| ClientError::InvalidJid(jid.to_string()))
}

/// Higher-level pubsub operations against one node service. Holds no
/// state of its own beyond the addresses it needs to stamp onto every
/// stanza — all correlation and timeout handling lives in
/// [`EventLoop`].
pub struct PubSub {
    event_loop: Arc<EventLoop>,
    service_jid: String,
    from_jid: String,
}

impl PubSub {
    /// `service_jid` is `pubsub.<domain>` where `<domain>` is the portion
    /// of `from_jid` after `@`, per spec §6.
    pub fn new(event_loop: Arc<EventLoop>, from_jid: impl Into<String>) -> ClientResult<Self> {
        let from_jid = from_jid.into();
        let domain = domain_of(&from_jid)?;
        Ok(Self {
            event_loop,
            service_jid: format!("pubsub.{domain}"),
            from_jid,
        })
    }

    fn iq(&self, type_attr: &str, namespace: &str, pubsub_child: Stanza) -> Stanza {
        Stanza::new("iq")
            .with_attr("type", type_attr)
            .with_attr("to", self.service_jid.clone())
            .with_attr("from", self.from_jid.clone())
            .with_child(Stanza::new("pubsub").with_namespace(namespace).with_child(pubsub_child))
    }

    fn send(&self, stanza: Stanza) -> ClientResult<Response> {
        self.event_loop.send_blocking(stanza)
    }

    /// Sends `stanza`, then redecodes the raw fragment stashed on the
    /// shell response into `shape`'s typed payload, surfacing a remote
    /// `<error/>` as [`ClientError::Remote`].
    fn send_decoded(&self, stanza: Stanza, shape: Shape) -> ClientResult<Response> {
        let id = stanza.id.clone();
        let shell = self.send(stanza)?;
        let raw = shell
            .stanza
            .as_ref()
            .and_then(|s| s.text.as_deref())
            .unwrap_or_default();
        let decoded = decoder::decode(raw.as_bytes(), &id, shape)?;
        if let PacketVariant::Error { code, description } = decoded.payload {
            return Err(ClientError::Remote { code, description });
        }
        Ok(decoded)
    }

    fn expect_ok(&self, stanza: Stanza) -> ClientResult<()> {
        let response = self.send(stanza)?;
        match response.type_attr.as_deref() {
            Some("error") => Err(ClientError::Remote {
                code: 0,
                description: response
                    .stanza
                    .and_then(|s| s.text)
                    .unwrap_or_else(|| "unknown remote error".to_string()),
            }),
            _ => Ok(()),
        }
    }

    // ---- Node lifecycle ----------------------------------------------

    #[instrument(skip(self))]
    pub fn create_node(&self, node: &str, title: Option<&str>, access_model: Option<&str>) -> ClientResult<()> {
        // `create` and `configure` are siblings under <pubsub>, not a
        // single child, so this bypasses `iq()`'s single-child shape.
        self.expect_ok(
            Stanza::new("iq")
                .with_attr("type", "set")
                .with_attr("to", self.service_jid.clone())
                .with_attr("from", self.from_jid.clone())
                .with_child(
                    Stanza::new("pubsub")
                        .with_namespace(NS_PUBSUB)
                        .with_child(Stanza::new("create").with_attr("node", node))
                        .with_child(configure_form(title, access_model)),
                ),
        )
    }

    #[instrument(skip(self))]
    pub fn delete_node(&self, node: &str) -> ClientResult<()> {
        let stanza = self.iq("set", NS_PUBSUB_OWNER, Stanza::new("delete").with_attr("node", node));
        self.expect_ok(stanza)
    }

    #[instrument(skip(self))]
    pub fn publish_item(&self, node: &str, item_id: &str, payload: Stanza) -> ClientResult<()> {
        let item = Stanza::new("item").with_attr("id", item_id).with_child(payload);
        let publish = Stanza::new("publish").with_attr("node", node).with_child(item);
        self.expect_ok(self.iq("set", NS_PUBSUB, publish))
    }

    #[instrument(skip(self))]
    pub fn item_recent_get(&self, node: &str, max_items: u32, item_id: Option<&str>) -> ClientResult<Response> {
        let mut items = Stanza::new("items").with_attr("node", node).with_attr("max_items", max_items.to_string());
        if let Some(item_id) = item_id {
            items = items.with_child(Stanza::new("item").with_attr("id", item_id));
        }
        self.send_decoded(self.iq("get", NS_PUBSUB, items), Shape::ItemRecentGet)
    }

    /// Fetches the single reserved-id item (`"meta"`, `"references"`,
    /// `"schedule"`) and returns `(correlation id, raw fragment)` so the
    /// caller can redecode it against its own shape — the generic
    /// `item_recent_get` above only ever produces a `Data` payload.
    fn fetch_reserved_item(&self, node: &str, item_id: &str) -> ClientResult<(String, String)> {
        let items = Stanza::new("items")
            .with_attr("node", node)
            .with_attr("max_items", "1")
            .with_child(Stanza::new("item").with_attr("id", item_id));
        let shell = self.send(self.iq("get", NS_PUBSUB, items))?;
        let raw = shell.stanza.as_ref().and_then(|s| s.text.clone()).unwrap_or_default();
        Ok((shell.id, raw))
    }

    // ---- Subscriptions -------------------------------------------------

    #[instrument(skip(self))]
    pub fn subscriptions_query(&self) -> ClientResult<Vec<Subscription>> {
        let response = self.send_decoded(self.iq("get", NS_PUBSUB, Stanza::new("subscriptions")), Shape::Subscriptions)?;
        match response.payload {
            PacketVariant::Subscriptions(list) => Ok(list),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    #[instrument(skip(self))]
    pub fn subscribe(&self, node: &str) -> ClientResult<()> {
        let existing = self.subscriptions_query()?;
        if existing.iter().any(|s| s.node == node) {
            return Err(ClientError::AlreadySubscribed);
        }
        let subscribe = Stanza::new("subscribe").with_attr("node", node).with_attr("jid", self.from_jid.clone());
        self.expect_ok(self.iq("set", NS_PUBSUB, subscribe))
    }

    #[instrument(skip(self))]
    pub fn unsubscribe(&self, node: &str, subid: Option<&str>) -> ClientResult<()> {
        let mut unsubscribe = Stanza::new("unsubscribe").with_attr("node", node).with_attr("jid", self.from_jid.clone());
        if let Some(subid) = subid {
            unsubscribe = unsubscribe.with_attr("subid", subid);
        }
        self.expect_ok(self.iq("set", NS_PUBSUB, unsubscribe))
    }

    // ---- Affiliations ----------------------------------------------------

    #[instrument(skip(self))]
    pub fn acl_affiliations_query(&self, node: Option<&str>) -> ClientResult<Vec<AffiliationEntry>> {
        let mut affiliations = Stanza::new("affiliations");
        if let Some(node) = node {
            affiliations = affiliations.with_attr("node", node);
        }
        let response = self.send_decoded(self.iq("get", NS_PUBSUB_OWNER, affiliations), Shape::Affiliations)?;
        match response.payload {
            PacketVariant::Affiliations(list) => Ok(list),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    #[instrument(skip(self))]
    pub fn acl_affiliation_set(&self, node: &str, jid: &str, kind: Affiliation) -> ClientResult<()> {
        let affiliation = Stanza::new("affiliation").with_attr("jid", jid).with_attr("affiliation", kind.as_str());
        let affiliations = Stanza::new("affiliations").with_attr("node", node).with_child(affiliation);
        self.expect_ok(self.iq("set", NS_PUBSUB_OWNER, affiliations))
    }

    // ---- Collections -------------------------------------------------

    #[instrument(skip(self))]
    pub fn collection_create(&self, node: &str, title: Option<&str>) -> ClientResult<()> {
        self.expect_ok(
            Stanza::new("iq")
                .with_attr("type", "set")
                .with_attr("to", self.service_jid.clone())
                .with_attr("from", self.from_jid.clone())
                .with_child(
                    Stanza::new("pubsub")
                        .with_namespace(NS_PUBSUB)
                        .with_child(Stanza::new("create").with_attr("node", node))
                        .with_child(configure_form_node_type(title, NodeType::Collection)),
                ),
        )
    }

    pub(crate) fn collection_children(&self, node: &str) -> ClientResult<Vec<CollectionEntry>> {
        let query = self.iq("get", "http://jabber.org/protocol/disco#items", Stanza::new("query").with_attr("node", node));
        let response = self.send_decoded(query, Shape::CollectionChildren)?;
        match response.payload {
            PacketVariant::Collections(list) => Ok(list),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    pub(crate) fn collection_parents(&self, node: &str) -> ClientResult<Vec<CollectionEntry>> {
        let meta = self.owner_configure_get(node)?;
        match meta.payload {
            PacketVariant::Collections(list) => Ok(list),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    fn owner_configure_get(&self, node: &str) -> ClientResult<Response> {
        let configure = Stanza::new("configure").with_attr("node", node);
        self.send_decoded(self.iq("get", NS_PUBSUB_OWNER, configure), Shape::CollectionParents)
    }

    fn publish_children_config(&self, node: &str, children: &[CollectionEntry]) -> ClientResult<()> {
        self.publish_collection_field(node, "pubsub#children", children)
    }

    fn publish_parents_config(&self, node: &str, parents: &[CollectionEntry]) -> ClientResult<()> {
        self.publish_collection_field(node, "pubsub#collection", parents)
    }

    fn publish_collection_field(&self, node: &str, var: &str, entries: &[CollectionEntry]) -> ClientResult<()> {
        let mut field = Stanza::new("field").with_attr("var", var);
        for entry in entries {
            field = field.with_child(Stanza::new("value").with_text(entry.node.clone()));
        }
        let form = Stanza::new("x").with_namespace(NS_DATA_FORMS).with_attr("type", "submit").with_child(field);
        let configure = Stanza::new("configure").with_attr("node", node).with_child(form);
        self.expect_ok(self.iq("set", NS_PUBSUB_OWNER, configure))
    }

    /// Links `parent` and `child` in both directions, per spec §4.6's
    /// "read current children of `parent`, read current parents of
    /// `child`, append the new link at both sides" description.
    #[instrument(skip(self))]
    pub fn collection_add_child(&self, parent: &str, child: &str) -> ClientResult<()> {
        let mut children = self.collection_children(parent)?;
        if children.iter().any(|c| c.node == child) {
            return Err(ClientError::DuplicateEntry);
        }
        let mut parents = self.collection_parents(child)?;
        if parents.iter().any(|p| p.node == parent) {
            return Err(ClientError::DuplicateEntry);
        }

        children.push(CollectionEntry { node: child.to_string(), name: None });
        parents.push(CollectionEntry { node: parent.to_string(), name: None });

        self.publish_children_config(parent, &children)?;
        self.publish_parents_config(child, &parents)
    }

    /// Symmetric removal; fails `NotAffiliated` without writing to
    /// whichever side already lacked the link.
    #[instrument(skip(self))]
    pub fn collection_remove_child(&self, parent: &str, child: &str) -> ClientResult<()> {
        let mut children = self.collection_children(parent)?;
        let mut parents = self.collection_parents(child)?;

        let had_child = children.iter().any(|c| c.node == child);
        let had_parent = parents.iter().any(|p| p.node == parent);
        if !had_child || !had_parent {
            return Err(ClientError::NotAffiliated);
        }

        children.retain(|c| c.node != child);
        parents.retain(|p| p.node != parent);

        self.publish_children_config(parent, &children)?;
        self.publish_parents_config(child, &parents)
    }

    // ---- Reference graphs ----------------------------------------------

    #[instrument(skip(self))]
    pub fn references_query(&self, node: &str) -> ClientResult<Vec<Reference>> {
        let (id, raw) = self.fetch_reserved_item(node, "references")?;
        let decoded = decoder::decode(raw.as_bytes(), &id, Shape::References)?;
        match decoded.payload {
            PacketVariant::References(list) => Ok(list),
            PacketVariant::Error { code, description } => Err(ClientError::Remote { code, description }),
            PacketVariant::Data { .. } => Ok(Vec::new()),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    fn meta_get(&self, node: &str) -> ClientResult<Meta> {
        let (id, raw) = self.fetch_reserved_item(node, "meta")?;
        let decoded = decoder::decode(raw.as_bytes(), &id, Shape::Meta)?;
        match decoded.payload {
            PacketVariant::Meta(meta) => Ok(meta),
            PacketVariant::Error { code, description } => Err(ClientError::Remote { code, description }),
            PacketVariant::Data { .. } => Ok(Meta::default()),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    fn publish_references(&self, node: &str, references: &[Reference]) -> ClientResult<()> {
        let mut item = Stanza::new("references");
        for reference in references {
            item = item.with_child(
                Stanza::new("reference")
                    .with_attr("type", reference.kind.as_str())
                    .with_attr("node", reference.node_id.clone())
                    .with_attr("metaType", reference.referenced_meta_kind.as_str()),
            );
        }
        self.publish_item(node, "references", item)
    }

    #[instrument(skip(self))]
    pub fn reference_child_add(&self, parent: &str, child: &str, also_at_child: bool) -> ClientResult<()> {
        let mut parent_refs = self.references_query(parent)?;
        if let Some(existing) = parent_refs.iter().find(|r| r.node_id == child) {
            return Err(match existing.kind {
                ReferenceKind::Child => ClientError::DuplicateEntry,
                ReferenceKind::Parent => ClientError::ReferenceLoop,
                ReferenceKind::Unknown => ClientError::DuplicateEntry,
            });
        }

        let parent_meta = self.meta_get(parent).unwrap_or_default();
        let child_meta = self.meta_get(child).unwrap_or_default();
        let child_kind = child_meta.kind.unwrap_or(crate::model::MetaKind::Unknown);
        let parent_kind = parent_meta.kind.unwrap_or(crate::model::MetaKind::Unknown);

        parent_refs.push(Reference {
            kind: ReferenceKind::Child,
            node_id: child.to_string(),
            display_name: None,
            referenced_meta_kind: child_kind,
        });
        self.publish_references(parent, &parent_refs)?;

        if also_at_child {
            let mut child_refs = self.references_query(child)?;
            child_refs.push(Reference {
                kind: ReferenceKind::Parent,
                node_id: parent.to_string(),
                display_name: None,
                referenced_meta_kind: parent_kind,
            });
            self.publish_references(child, &child_refs)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn reference_child_remove(&self, parent: &str, child: &str) -> ClientResult<()> {
        let mut parent_refs = self.references_query(parent)?;
        let mut child_refs = self.references_query(child)?;

        let removed_at_parent = remove_reference(&mut parent_refs, child);
        let removed_at_child = remove_reference(&mut child_refs, parent);

        if removed_at_parent {
            self.publish_references(parent, &parent_refs)?;
        }
        if removed_at_child {
            self.publish_references(child, &child_refs)?;
        }
        if removed_at_parent || removed_at_child {
            Ok(())
        } else {
            Err(ClientError::NotAffiliated)
        }
    }

    /// Keeps every peer's cached `metaType` in sync after `node`'s own
    /// meta kind changes.
    #[instrument(skip(self))]
    pub fn reference_meta_overwrite_on_peers(&self, node: &str, new_kind: crate::model::MetaKind) -> ClientResult<()> {
        let refs = self.references_query(node)?;
        for reference in &refs {
            let mut peer_refs = self.references_query(&reference.node_id)?;
            for peer_ref in &mut peer_refs {
                if peer_ref.node_id == node {
                    peer_ref.referenced_meta_kind = new_kind;
                }
            }
            self.publish_references(&reference.node_id, &peer_refs)?;
        }
        Ok(())
    }

    // ---- Schedules -------------------------------------------------

    #[instrument(skip(self))]
    pub fn schedule_get(&self, node: &str) -> ClientResult<Schedule> {
        let (id, raw) = self.fetch_reserved_item(node, "schedule")?;
        let decoded = decoder::decode(raw.as_bytes(), &id, Shape::Schedule)?;
        match decoded.payload {
            PacketVariant::Schedule(events) => Ok(Schedule::from_events(events)),
            PacketVariant::Error { code, description } => Err(ClientError::Remote { code, description }),
            PacketVariant::Data { .. } => Ok(Schedule::default()),
            _ => Err(ClientError::UnexpectedPayload),
        }
    }

    #[instrument(skip(self))]
    pub fn schedule_merge(&self, node: &str, incoming: Vec<ScheduleEvent>) -> ClientResult<Schedule> {
        let mut schedule = self.schedule_get(node)?;
        schedule.merge(incoming);
        self.publish_schedule(node, &schedule)?;
        Ok(schedule)
    }

    #[instrument(skip(self))]
    pub fn schedule_remove(&self, node: &str, id: u32) -> ClientResult<Schedule> {
        let mut schedule = self.schedule_get(node)?;
        if !schedule.remove(id) {
            return Err(ClientError::RequestNotFound);
        }
        self.publish_schedule(node, &schedule)?;
        Ok(schedule)
    }

    fn publish_schedule(&self, node: &str, schedule: &Schedule) -> ClientResult<()> {
        let mut item = Stanza::new("schedule");
        for event in schedule.events() {
            let mut event_stanza = Stanza::new("event")
                .with_attr("id", event.id.to_string())
                .with_attr("time", event.time.clone())
                .with_attr("transducerName", event.transducer_name.clone())
                .with_attr("transducerValue", event.transducer_value.clone());
            if let Some(info) = &event.info {
                event_stanza = event_stanza.with_attr("info", info.clone());
            }
            if let Some(recurrence) = &event.recurrence {
                event_stanza = event_stanza.with_child(recurrence_stanza(recurrence));
            }
            item = item.with_child(event_stanza);
        }
        self.publish_item(node, "schedule", item)
    }

    // ---- Meta -------------------------------------------------

    #[instrument(skip(self))]
    pub fn meta_merge_publish(&self, node: &str, incoming: &Meta) -> ClientResult<Meta> {
        let mut meta = self.meta_get(node).unwrap_or_default();
        let identity_changed = meta.identity_changed(incoming);
        meta.merge(incoming);
        self.publish_meta(node, &meta)?;
        if identity_changed {
            self.reference_meta_overwrite_on_peers(node, meta.kind.unwrap_or(crate::model::MetaKind::Unknown))?;
        }
        Ok(meta)
    }

    fn publish_meta(&self, node: &str, meta: &Meta) -> ClientResult<()> {
        let mut item = Stanza::new("meta").with_namespace("http://jabber.org/protocol/mio");
        if let Some(kind) = meta.kind {
            item = item.with_attr("type", kind.as_str());
        }
        if let Some(name) = &meta.name {
            item = item.with_attr("name", name.clone());
        }
        if let Some(timestamp) = &meta.timestamp {
            item = item.with_attr("timestamp", timestamp.clone());
        }
        if let Some(info) = &meta.info {
            item = item.with_attr("info", info.clone());
        }
        for transducer in &meta.transducer_meta {
            item = item.with_child(transducer_meta_stanza(transducer));
        }
        for property in &meta.properties {
            item = item.with_child(property_stanza(property));
        }
        if let Some(geoloc) = &meta.geolocation {
            item = item.with_child(geoloc_stanza(geoloc));
        }
        self.publish_item(node, "meta", item)
    }
}

fn property_stanza(property: &crate::model::Property) -> Stanza {
    Stanza::new("property")
        .with_attr("name", property.name.clone())
        .with_attr("value", property.value.clone())
}

fn geoloc_stanza(geoloc: &crate::model::Geolocation) -> Stanza {
    let mut stanza = Stanza::new("geoloc");
    if let Some(lat) = &geoloc.lat {
        stanza = stanza.with_child(Stanza::new("lat").with_text(lat.clone()));
    }
    if let Some(lon) = &geoloc.lon {
        stanza = stanza.with_child(Stanza::new("lon").with_text(lon.clone()));
    }
    if let Some(alt) = &geoloc.alt {
        stanza = stanza.with_child(Stanza::new("alt").with_text(alt.clone()));
    }
    if let Some(accuracy) = &geoloc.accuracy {
        stanza = stanza.with_child(Stanza::new("accuracy").with_text(accuracy.clone()));
    }
    stanza
}

fn transducer_meta_stanza(transducer: &crate::model::TransducerMeta) -> Stanza {
    let mut stanza = Stanza::new("transducer").with_attr("name", transducer.name.clone());
    if let Some(min) = &transducer.min {
        stanza = stanza.with_attr("min", min.clone());
    }
    if let Some(max) = &transducer.max {
        stanza = stanza.with_attr("max", max.clone());
    }
    if let Some(resolution) = &transducer.resolution {
        stanza = stanza.with_attr("resolution", resolution.clone());
    }
    if let Some(precision) = &transducer.precision {
        stanza = stanza.with_attr("precision", precision.clone());
    }
    if let Some(accuracy) = &transducer.accuracy {
        stanza = stanza.with_attr("accuracy", accuracy.clone());
    }
    if let Some(unit) = &transducer.unit {
        stanza = stanza.with_attr("unit", unit.clone());
    }
    if let Some(interface) = &transducer.interface {
        stanza = stanza.with_attr("interface", interface.clone());
    }
    if let Some(manufacturer) = &transducer.manufacturer {
        stanza = stanza.with_attr("manufacturer", manufacturer.clone());
    }
    if let Some(serial) = &transducer.serial {
        stanza = stanza.with_attr("serial", serial.clone());
    }
    for (name, value) in &transducer.enumeration {
        stanza = stanza.with_child(Stanza::new("map").with_attr("name", name.clone()).with_attr("value", value.clone()));
    }
    for property in &transducer.properties {
        stanza = stanza.with_child(property_stanza(property));
    }
    if let Some(geoloc) = &transducer.geolocation {
        stanza = stanza.with_child(geoloc_stanza(geoloc));
    }
    stanza
}

fn recurrence_stanza(recurrence: &crate::model::Recurrence) -> Stanza {
    let mut stanza = Stanza::new("recurrence");
    if let Some(freq) = &recurrence.freq {
        stanza = stanza.with_child(Stanza::new("freq").with_text(freq.clone()));
    }
    if let Some(interval) = recurrence.interval {
        stanza = stanza.with_child(Stanza::new("interval").with_text(interval.to_string()));
    }
    if let Some(count) = recurrence.count {
        stanza = stanza.with_child(Stanza::new("count").with_text(count.to_string()));
    }
    if let Some(until) = &recurrence.until {
        stanza = stanza.with_child(Stanza::new("until").with_text(until.clone()));
    }
    if let Some(bymonth) = &recurrence.bymonth {
        stanza = stanza.with_child(Stanza::new("bymonth").with_text(bymonth.clone()));
    }
    if let Some(byday) = &recurrence.byday {
        stanza = stanza.with_child(Stanza::new("byday").with_text(byday.clone()));
    }
    for exdate in &recurrence.exdate {
        stanza = stanza.with_child(Stanza::new("exdate").with_text(exdate.clone()));
    }
    stanza
}

fn remove_reference(refs: &mut Vec<Reference>, node_id: &str) -> bool {
    let before = refs.len();
    refs.retain(|r| r.node_id != node_id);
    refs.len() != before
}

fn data_field(var: &str, value: &str) -> Stanza {
    Stanza::new("field").with_attr("var", var).with_child(Stanza::new("value").with_text(value))
}

fn configure_form(title: Option<&str>, access_model: Option<&str>) -> Stanza {
    let mut form = Stanza::new("x").with_namespace(NS_DATA_FORMS).with_attr("type", "submit");
    form = form.with_child(data_field("pubsub#max_items", "500"));
    if let Some(title) = title {
        form = form.with_child(data_field("pubsub#title", title));
    }
    if let Some(access_model) = access_model {
        form = form.with_child(data_field("pubsub#access_model", access_model));
    }
    Stanza::new("configure").with_child(form)
}

fn configure_form_node_type(title: Option<&str>, node_type: NodeType) -> Stanza {
    let mut form = Stanza::new("x").with_namespace(NS_DATA_FORMS).with_attr("type", "submit");
    let type_str = match node_type {
        NodeType::Leaf => "leaf",
        NodeType::Collection => "collection",
        NodeType::Unknown => "leaf",
    };
    form = form.with_child(data_field("pubsub#node_type", type_str));
    if let Some(title) = title {
        form = form.with_child(data_field("pubsub#title", title));
    }
    Stanza::new("configure").with_child(form)
}

#[cfg(test)]
mod tests {
    use super::domain_of;
    use super::PubSub;
    use crate::config::Config;
    use crate::error::ClientError;
    use crate::event_loop::{Connector, EventLoop};
    use crate::model::{Meta, ReferenceKind};
    use crate::notify_queue::NotifyQueue;
    use crate::request_table::RequestTable;
    use crate::session::Session;
    use crate::transport::{LoopbackTransport, Transport};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn domain_of_strips_user_and_resource() {
        assert_eq!(domain_of("user@example.com/resource").unwrap(), "example.com");
        assert_eq!(domain_of("user@example.com").unwrap(), "example.com");
    }

    #[test]
    fn domain_of_rejects_jid_without_at() {
        assert!(domain_of("not-a-jid").is_err());
    }

    fn test_pubsub(client: LoopbackTransport) -> PubSub {
        let transport = StdMutex::new(Some(client));
        let connector: Connector = Box::new(move || {
            transport
                .lock()
                .unwrap()
                .take()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| ClientError::Connection("already connected once".into()))
        });
        let event_loop = Arc::new(EventLoop::new(
            Config::testing(),
            Arc::new(Session::new()),
            Arc::new(RequestTable::new(8)),
            Arc::new(NotifyQueue::new(3)),
            connector,
        ));
        event_loop.start();
        event_loop.wait_until_settled(Duration::from_secs(2));
        PubSub::new(event_loop, "sensor-hub@example.com").unwrap()
    }

    /// Replies to each request in `replies`'s order with that template,
    /// substituting `{id}` for the correlation id the request carried.
    fn script(mut server: LoopbackTransport, replies: Vec<&'static str>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for template in replies {
                let id = loop {
                    let bytes = server.read_available().unwrap();
                    if !bytes.is_empty() {
                        let text = String::from_utf8(bytes).unwrap();
                        break text.split("id=\"").nth(1).unwrap().split('"').next().unwrap().to_string();
                    }
                    thread::sleep(Duration::from_millis(5));
                };
                let reply = template.replace("{id}", &id);
                server.write_pending(reply.as_bytes()).unwrap();
            }
        })
    }

    /// I5: adding a child reference links both nodes reciprocally — the
    /// parent gets a `Child` reference and the child gets a `Parent`
    /// reference back, each carrying the other's meta kind.
    #[test]
    fn reference_child_add_links_both_sides_reciprocally() {
        let (client, server) = LoopbackTransport::pair();
        let pubsub = test_pubsub(client);
        let responder = script(
            server,
            vec![
                // references_query(parent): none yet
                r#"<iq type="result" id="{id}"><references/></iq>"#,
                // meta_get(parent)
                r#"<iq type="result" id="{id}"><meta type="location" name="Living Room"/></iq>"#,
                // meta_get(child)
                r#"<iq type="result" id="{id}"><meta type="device" name="Thermostat"/></iq>"#,
                // publish_references(parent, ...)
                r#"<iq type="result" id="{id}"/>"#,
                // references_query(child): none yet
                r#"<iq type="result" id="{id}"><references/></iq>"#,
                // publish_references(child, ...)
                r#"<iq type="result" id="{id}"/>"#,
            ],
        );

        pubsub.reference_child_add("home/livingroom", "home/livingroom/thermostat", true).unwrap();
        responder.join().unwrap();
    }

    /// Adding a link that already exists from the parent's side is
    /// rejected before any publish is attempted.
    #[test]
    fn reference_child_add_rejects_existing_duplicate() {
        let (client, server) = LoopbackTransport::pair();
        let pubsub = test_pubsub(client);
        let responder = script(
            server,
            vec![r#"<iq type="result" id="{id}"><references><reference type="child" node="home/livingroom/thermostat" metaType="device"/></references></iq>"#],
        );

        let err = pubsub.reference_child_add("home/livingroom", "home/livingroom/thermostat", true).unwrap_err();
        assert!(matches!(err, ClientError::DuplicateEntry));
        responder.join().unwrap();
    }

    /// Removing a link that exists on both sides clears it reciprocally;
    /// a second removal of the same pair reports `NotAffiliated`.
    #[test]
    fn reference_child_remove_clears_both_sides() {
        let (client, server) = LoopbackTransport::pair();
        let pubsub = test_pubsub(client);
        let responder = script(
            server,
            vec![
                // references_query(parent)
                r#"<iq type="result" id="{id}"><references><reference type="child" node="leaf" metaType="device"/></references></iq>"#,
                // references_query(child)
                r#"<iq type="result" id="{id}"><references><reference type="parent" node="parent" metaType="location"/></references></iq>"#,
                // publish_references(parent, ...) -- now empty
                r#"<iq type="result" id="{id}"/>"#,
                // publish_references(child, ...) -- now empty
                r#"<iq type="result" id="{id}"/>"#,
            ],
        );

        pubsub.reference_child_remove("parent", "leaf").unwrap();
        responder.join().unwrap();
    }

    #[test]
    fn reference_kind_round_trips_through_strings() {
        for kind in [ReferenceKind::Child, ReferenceKind::Parent] {
            assert_eq!(ReferenceKind::parse(kind.as_str()), kind);
        }
    }

    /// `meta_merge_publish` must put `transducer_meta`/`properties`/
    /// `geolocation` on the wire, not just in the merged in-memory value,
    /// or a second client decoding the published item loses them.
    #[test]
    fn meta_merge_publish_serializes_transducer_and_geoloc_onto_the_wire() {
        use crate::model::{Geolocation, MetaKind, Property, TransducerMeta};

        let (client, mut server) = LoopbackTransport::pair();
        let pubsub = test_pubsub(client);

        let next_request = |server: &mut LoopbackTransport| -> String {
            loop {
                let bytes = server.read_available().unwrap();
                if !bytes.is_empty() {
                    return String::from_utf8(bytes).unwrap();
                }
                thread::sleep(Duration::from_millis(5));
            }
        };
        let id_of = |text: &str| text.split("id=\"").nth(1).unwrap().split('"').next().unwrap().to_string();

        let incoming = Meta {
            name: Some("Thermostat".to_string()),
            kind: Some(MetaKind::Device),
            geolocation: Some(Geolocation { lat: Some("51.5".to_string()), lon: Some("-0.1".to_string()), ..Default::default() }),
            properties: vec![Property { name: "room".to_string(), value: "living".to_string() }],
            transducer_meta: vec![TransducerMeta {
                name: "temp".to_string(),
                unit: Some("C".to_string()),
                properties: vec![Property { name: "vendor".to_string(), value: "acme".to_string() }],
                geolocation: Some(Geolocation { alt: Some("12".to_string()), ..Default::default() }),
                ..Default::default()
            }],
            ..Default::default()
        };

        let worker = {
            let pubsub_for_thread = &pubsub;
            thread::scope(move |scope| {
                let handle = scope.spawn(move || pubsub_for_thread.meta_merge_publish("sensor/living", &incoming));

                let get_request = next_request(&mut server);
                server.write_pending(format!(r#"<iq type="result" id="{}"/>"#, id_of(&get_request)).as_bytes()).unwrap();

                let publish_request = next_request(&mut server);
                server.write_pending(format!(r#"<iq type="result" id="{}"/>"#, id_of(&publish_request)).as_bytes()).unwrap();

                (handle.join().unwrap(), publish_request)
            })
        };
        let (result, publish_request) = worker;
        result.unwrap();

        assert!(publish_request.contains("<transducer"));
        assert!(publish_request.contains(r#"unit="C""#));
        assert!(publish_request.contains(r#"<property name="room" value="living"></property>"#));
        assert!(publish_request.contains(r#"<property name="vendor" value="acme"></property>"#));
        assert!(publish_request.contains("<geoloc>"));
        assert!(publish_request.contains("<lat>51.5</lat>"));
        assert!(publish_request.contains("<alt>12</alt>"));
    }
}
