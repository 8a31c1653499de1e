//! Owned data model: stanzas, decoded responses, and the domain payloads
//! (meta, references, schedules) that ride inside pubsub items.
//!
//! Per spec §9's first re-architecture note, every payload here is an
//! owned tree of tagged variants — lists are `Vec`s, parent/child links
//! are plain fields — rather than the source's linked lists threaded
//! through the underlying XML library's node pointers.

use std::collections::BTreeMap;

use uuid::Uuid;

/// A single top-level XML element plus its subtree, identified by a
/// 36-character correlation id (spec §3, "Stanza").
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    pub name: String,
    pub namespace: Option<String>,
    pub id: String,
    pub attrs: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Stanza>,
}

impl Stanza {
    /// Builds a bare element with a freshly generated 36-character id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            id: new_stanza_id(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Stanza) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Generates a 36-character unique id in the shape the source used for
/// stanza correlation keys (spec §3).
pub fn new_stanza_id() -> String {
    Uuid::new_v4().to_string()
}

/// Affiliation a jid holds on a node's ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    None,
    Owner,
    Member,
    Publisher,
    PublishOnly,
    Outcast,
}

impl Affiliation {
    pub fn as_str(self) -> &'static str {
        match self {
            Affiliation::None => "none",
            Affiliation::Owner => "owner",
            Affiliation::Member => "member",
            Affiliation::Publisher => "publisher",
            Affiliation::PublishOnly => "publish-only",
            Affiliation::Outcast => "outcast",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "none" => Affiliation::None,
            "owner" => Affiliation::Owner,
            "member" => Affiliation::Member,
            "publisher" => Affiliation::Publisher,
            "publish-only" => Affiliation::PublishOnly,
            "outcast" => Affiliation::Outcast,
            _ => return None,
        })
    }
}

/// Whether a pubsub node is a leaf (accepts items) or a collection
/// (groups other nodes), per XEP-0248.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Collection,
    Unknown,
}

/// One subscription entry returned by a subscriptions query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub node: String,
    pub jid: String,
    pub subid: Option<String>,
}

/// One affiliation entry returned by an affiliations query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationEntry {
    pub node: String,
    pub jid: String,
    pub affiliation: Affiliation,
}

/// A collection member discovered via disco#items, or a parent collection
/// name discovered via a `pubsub#collection` data form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub node: String,
    pub name: Option<String>,
}

/// One measurement or setpoint carried in a `<data>` item (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct TransducerReading {
    pub kind: TransducerKind,
    pub name: String,
    pub value: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransducerKind {
    Single,
    Set,
}

/// Kind of device/entity a meta item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Unknown,
    Device,
    Location,
    Gateway,
    Adapter,
    Agent,
}

impl MetaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaKind::Unknown => "unknown",
            MetaKind::Device => "device",
            MetaKind::Location => "location",
            MetaKind::Gateway => "gateway",
            MetaKind::Adapter => "adapter",
            MetaKind::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "device" => MetaKind::Device,
            "location" => MetaKind::Location,
            "gateway" => MetaKind::Gateway,
            "adapter" => MetaKind::Adapter,
            "agent" => MetaKind::Agent,
            _ => MetaKind::Unknown,
        }
    }
}

/// Geolocation payload, attachable to either a meta item or a transducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geolocation {
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub alt: Option<String>,
    pub accuracy: Option<String>,
}

impl Geolocation {
    /// Field-by-field overwrite, per the merge rules in spec §4.6.
    pub fn merge(&mut self, incoming: &Geolocation) {
        if incoming.lat.is_some() {
            self.lat = incoming.lat.clone();
        }
        if incoming.lon.is_some() {
            self.lon = incoming.lon.clone();
        }
        if incoming.alt.is_some() {
            self.alt = incoming.alt.clone();
        }
        if incoming.accuracy.is_some() {
            self.accuracy = incoming.accuracy.clone();
        }
    }
}

/// A typed property attached to a meta item or a transducer.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Per-transducer metadata nested inside a `Meta` item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransducerMeta {
    pub name: String,
    pub min: Option<String>,
    pub max: Option<String>,
    pub resolution: Option<String>,
    pub precision: Option<String>,
    pub accuracy: Option<String>,
    pub unit: Option<String>,
    pub interface: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
    pub geolocation: Option<Geolocation>,
    /// `name -> value` enumeration map; replaced wholesale on merge.
    pub enumeration: BTreeMap<String, String>,
    pub properties: Vec<Property>,
}

impl TransducerMeta {
    fn merge_scalar(dst: &mut Option<String>, src: &Option<String>) {
        if src.is_some() {
            *dst = src.clone();
        }
    }

    /// Overwrite matched fields, replace the enumeration map wholesale,
    /// and merge the property list by name — spec §4.6 merge rules.
    pub fn merge(&mut self, incoming: &TransducerMeta) {
        Self::merge_scalar(&mut self.min, &incoming.min);
        Self::merge_scalar(&mut self.max, &incoming.max);
        Self::merge_scalar(&mut self.resolution, &incoming.resolution);
        Self::merge_scalar(&mut self.precision, &incoming.precision);
        Self::merge_scalar(&mut self.accuracy, &incoming.accuracy);
        Self::merge_scalar(&mut self.unit, &incoming.unit);
        Self::merge_scalar(&mut self.interface, &incoming.interface);
        Self::merge_scalar(&mut self.manufacturer, &incoming.manufacturer);
        Self::merge_scalar(&mut self.serial, &incoming.serial);
        if let Some(geo) = &incoming.geolocation {
            self.geolocation.get_or_insert_with(Geolocation::default).merge(geo);
        }
        if !incoming.enumeration.is_empty() {
            self.enumeration = incoming.enumeration.clone();
        }
        merge_properties(&mut self.properties, &incoming.properties);
    }
}

fn merge_properties(existing: &mut Vec<Property>, incoming: &[Property]) {
    for prop in incoming {
        if let Some(slot) = existing.iter_mut().find(|p| p.name == prop.name) {
            slot.value = prop.value.clone();
        } else {
            existing.push(prop.clone());
        }
    }
}

/// The singleton `"meta"` item describing a node's device/location/etc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub name: Option<String>,
    pub info: Option<String>,
    pub timestamp: Option<String>,
    pub kind: Option<MetaKind>,
    pub geolocation: Option<Geolocation>,
    pub transducer_meta: Vec<TransducerMeta>,
    pub properties: Vec<Property>,
}

impl Meta {
    /// Field-by-field merge per spec §4.6's "Merge rules" paragraph:
    /// scalars overwrite only when the incoming value is present;
    /// transducer/property lists match by name, overwriting matched
    /// entries and appending unmatched ones.
    ///
    /// Resolves spec §9's third Open Question: `timestamp` is treated
    /// like any other optional scalar, not a mandatory field.
    pub fn merge(&mut self, incoming: &Meta) {
        if incoming.name.is_some() {
            self.name = incoming.name.clone();
        }
        if incoming.info.is_some() {
            self.info = incoming.info.clone();
        }
        if incoming.timestamp.is_some() {
            self.timestamp = incoming.timestamp.clone();
        }
        if incoming.kind.is_some() {
            self.kind = incoming.kind;
        }
        if let Some(geo) = &incoming.geolocation {
            self.geolocation.get_or_insert_with(Geolocation::default).merge(geo);
        }
        for incoming_td in &incoming.transducer_meta {
            if let Some(slot) = self
                .transducer_meta
                .iter_mut()
                .find(|td| td.name == incoming_td.name)
            {
                slot.merge(incoming_td);
            } else {
                self.transducer_meta.push(incoming_td.clone());
            }
        }
        merge_properties(&mut self.properties, &incoming.properties);
    }

    /// True if merging `incoming` into this meta would change the
    /// identity fields that peers cache (used to decide whether
    /// `reference_meta_overwrite_on_peers` must run).
    pub fn identity_changed(&self, incoming: &Meta) -> bool {
        (incoming.kind.is_some() && incoming.kind != self.kind)
            || (incoming.name.is_some() && incoming.name != self.name)
    }
}

/// A free-form node-to-node link (distinct from a pubsub collection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Child,
    Parent,
    Unknown,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Child => "child",
            ReferenceKind::Parent => "parent",
            ReferenceKind::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "child" => ReferenceKind::Child,
            "parent" => ReferenceKind::Parent,
            _ => ReferenceKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub node_id: String,
    pub display_name: Option<String>,
    pub referenced_meta_kind: MetaKind,
}

/// iCalendar-style recurrence attached to a schedule event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recurrence {
    pub freq: Option<String>,
    pub interval: Option<u32>,
    pub count: Option<u32>,
    pub until: Option<String>,
    pub bymonth: Option<String>,
    pub byday: Option<String>,
    pub exdate: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEvent {
    /// Contiguous from 0 within its schedule (I4); assigned by the
    /// schedule container, never by the caller.
    pub id: u32,
    pub transducer_name: String,
    pub transducer_value: String,
    pub time: String,
    pub info: Option<String>,
    pub recurrence: Option<Recurrence>,
}

/// The singleton `"schedule"` item: an ordered, contiguously-id'd list of
/// events. All mutation goes through `merge`/`remove` so I4 always holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    events: Vec<ScheduleEvent>,
}

impl Schedule {
    pub fn events(&self) -> &[ScheduleEvent] {
        &self.events
    }

    pub fn from_events(events: Vec<ScheduleEvent>) -> Self {
        let mut schedule = Schedule { events };
        schedule.renumber();
        schedule
    }

    /// Merges incoming events by id: matching ids overwrite in place,
    /// unmatched ids append. Renumbers afterward so I4 holds even if the
    /// incoming ids were not already contiguous.
    pub fn merge(&mut self, incoming: Vec<ScheduleEvent>) {
        for event in incoming {
            if let Some(slot) = self.events.iter_mut().find(|e| e.id == event.id) {
                *slot = event;
            } else {
                self.events.push(event);
            }
        }
        self.renumber();
    }

    /// Removes the event with the given id, if present, and renumbers the
    /// remainder contiguously from 0 (I4, spec scenario 6).
    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.events.len();
        self.events.retain(|e| e.id != id);
        let removed = self.events.len() != before;
        if removed {
            self.renumber();
        }
        removed
    }

    fn renumber(&mut self) {
        self.events.sort_by_key(|e| e.id);
        for (idx, event) in self.events.iter_mut().enumerate() {
            event.id = idx as u32;
        }
    }
}

/// The decoded shape of a response payload (spec §3, `PacketVariant`).
#[derive(Debug, Clone, PartialEq)]
pub enum PacketVariant {
    Ok,
    Error { code: i32, description: String },
    Data {
        event: Option<String>,
        transducers: Vec<TransducerReading>,
    },
    Subscriptions(Vec<Subscription>),
    Affiliations(Vec<AffiliationEntry>),
    Collections(Vec<CollectionEntry>),
    Meta(Meta),
    Schedule(Vec<ScheduleEvent>),
    References(Vec<Reference>),
    NodeType(NodeType),
    Unknown,
}

/// A decoded inbound stanza, correlated back to its request (if any) by
/// `id` (spec §3, "Response").
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub namespace: Option<String>,
    pub element_name: Option<String>,
    pub type_attr: Option<String>,
    pub payload: PacketVariant,
    pub stanza: Option<Stanza>,
}

impl Response {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: None,
            element_name: None,
            type_attr: Some("result".to_string()),
            payload: PacketVariant::Ok,
            stanza: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, PacketVariant::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_merge_and_remove_keeps_ids_contiguous() {
        let mut schedule = Schedule::default();
        schedule.merge(vec![
            ScheduleEvent {
                id: 0,
                transducer_name: "t".into(),
                transducer_value: "1".into(),
                time: "T1".into(),
                info: None,
                recurrence: None,
            },
            ScheduleEvent {
                id: 1,
                transducer_name: "t".into(),
                transducer_value: "2".into(),
                time: "T2".into(),
                info: None,
                recurrence: None,
            },
            ScheduleEvent {
                id: 2,
                transducer_name: "t".into(),
                transducer_value: "3".into(),
                time: "T3".into(),
                info: None,
                recurrence: None,
            },
        ]);

        assert!(schedule.remove(1));

        let ids: Vec<u32> = schedule.events().iter().map(|e| e.id).collect();
        let times: Vec<&str> = schedule.events().iter().map(|e| e.time.as_str()).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(times, vec!["T1", "T3"]);
    }

    #[test]
    fn meta_merge_overwrites_present_fields_only() {
        let mut meta = Meta {
            name: Some("sensor".into()),
            info: Some("old info".into()),
            timestamp: Some("T0".into()),
            kind: Some(MetaKind::Device),
            ..Default::default()
        };

        let incoming = Meta {
            name: None,
            info: Some("new info".into()),
            timestamp: None,
            kind: None,
            ..Default::default()
        };

        meta.merge(&incoming);

        assert_eq!(meta.name.as_deref(), Some("sensor"));
        assert_eq!(meta.info.as_deref(), Some("new info"));
        assert_eq!(meta.timestamp.as_deref(), Some("T0"));
        assert_eq!(meta.kind, Some(MetaKind::Device));
    }

    #[test]
    fn meta_merge_tolerates_absent_timestamp() {
        // Resolves spec §9's Open Question: timestamp is optional like
        // any other scalar, not a mandatory field.
        let mut meta = Meta::default();
        let incoming = Meta {
            name: Some("sensor".into()),
            timestamp: None,
            ..Default::default()
        };
        meta.merge(&incoming);
        assert_eq!(meta.name.as_deref(), Some("sensor"));
        assert_eq!(meta.timestamp, None);
    }

    #[test]
    fn affiliation_round_trips_through_strings() {
        for kind in [
            Affiliation::None,
            Affiliation::Owner,
            Affiliation::Member,
            Affiliation::Publisher,
            Affiliation::PublishOnly,
            Affiliation::Outcast,
        ] {
            assert_eq!(Affiliation::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Affiliation::parse("bogus"), None);
    }

    #[test]
    fn stanza_id_is_36_characters() {
        let stanza = Stanza::new("iq");
        assert_eq!(stanza.id.len(), 36);
    }

    fn event(id: u32, time: &str) -> ScheduleEvent {
        ScheduleEvent {
            id,
            transducer_name: "t".into(),
            transducer_value: "1".into(),
            time: time.to_string(),
            info: None,
            recurrence: None,
        }
    }

    proptest::proptest! {
        /// I4: after any sequence of merges and removals, ids stay a
        /// contiguous `0..len` run no matter what ids the caller merged in.
        #[test]
        fn schedule_ids_stay_contiguous_after_arbitrary_merges_and_removals(
            merged_ids in proptest::collection::vec(0u32..50, 0..20),
            removed_ids in proptest::collection::vec(0u32..50, 0..20),
        ) {
            let mut schedule = Schedule::default();
            let incoming: Vec<ScheduleEvent> = merged_ids
                .iter()
                .enumerate()
                .map(|(i, id)| event(*id, &format!("T{i}")))
                .collect();
            schedule.merge(incoming);

            for id in removed_ids {
                schedule.remove(id);
            }

            let ids: Vec<u32> = schedule.events().iter().map(|e| e.id).collect();
            let expected: Vec<u32> = (0..ids.len() as u32).collect();
            proptest::prop_assert_eq!(ids, expected);
        }

        /// Merging an event whose id already exists overwrites that event
        /// in place rather than appending a duplicate.
        #[test]
        fn schedule_merge_by_existing_id_never_grows_the_event_count(
            initial_len in 1usize..10,
            overwrite_id in 0u32..10,
        ) {
            let initial: Vec<ScheduleEvent> = (0..initial_len as u32)
                .map(|i| event(i, &format!("T{i}")))
                .collect();
            let mut schedule = Schedule::from_events(initial);
            let before = schedule.events().len();

            let target_id = overwrite_id % before as u32;
            schedule.merge(vec![event(target_id, "TX")]);

            proptest::prop_assert_eq!(schedule.events().len(), before);
        }
    }
}
