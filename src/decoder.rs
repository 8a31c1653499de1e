//! SAX-style response decoder (C5).
//!
//! Per spec §9's second re-architecture note, the callback-driven parser
//! with a shared mutable `userdata` struct becomes an explicit `Decoder`
//! object owning both the accumulator and the element stack. [`decode`]
//! drives a `quick_xml` pull [`Reader`](quick_xml::Reader) one event at a
//! time and feeds `on_start`/`on_text`/`on_end` — the
//! element-start/character-data/element-end interface spec §1 calls out
//! as the only thing the core actually needs from an XML library, so a
//! different tokenizer can be substituted by reimplementing [`decode`]
//! against it without touching any of the per-shape logic below.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ClientError, ClientResult};
use crate::model::{
    AffiliationEntry, CollectionEntry, Geolocation, Meta, MetaKind, NodeType, PacketVariant,
    Property, Recurrence, Reference, ReferenceKind, Response, ScheduleEvent, Subscription,
    TransducerKind, TransducerMeta, TransducerReading,
};

/// Which decoder in the catalogue (spec §4.5) is driving this parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Unsolicited `items` notification — completion enqueues onto C3.
    ItemsReceived,
    /// Solicited `item_recent_get` — completion resolves a blocking call.
    ItemRecentGet,
    Subscriptions,
    Affiliations,
    CollectionChildren,
    CollectionParents,
    Meta,
    NodeType,
    References,
    Schedule,
}

/// Tracks `{current_element_name, previous_element_name, depth,
/// parent_stack}` exactly as named in spec §4.5.
struct DecodeState {
    depth: usize,
    parent_stack: Vec<String>,
    current_element: String,
    previous_element: String,
}

impl DecodeState {
    fn new() -> Self {
        Self {
            depth: 0,
            parent_stack: Vec::new(),
            current_element: String::new(),
            previous_element: String::new(),
        }
    }

    fn parent(&self) -> Option<&str> {
        self.parent_stack.last().map(String::as_str)
    }

    fn push(&mut self, name: &str) {
        self.depth += 1;
        if !self.current_element.is_empty() {
            self.parent_stack.push(self.current_element.clone());
        }
        self.previous_element = std::mem::replace(&mut self.current_element, name.to_string());
    }

    fn pop(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.previous_element = self.current_element.clone();
        self.current_element = self.parent_stack.pop().unwrap_or_default();
    }
}

/// Which attribute kind a free-floating `jid`/`node` tie-break last
/// resolved to, per spec §4.5's "first-seen wins, subsequent of the other
/// kind overwrites" rule.
fn resolve_jid_or_node(attrs: &[(String, String)]) -> Option<String> {
    let mut resolved = None;
    for (key, value) in attrs {
        if key == "jid" || key == "node" {
            resolved = Some(value.clone());
        }
    }
    resolved
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn read_attrs(e: &quick_xml::events::BytesStart) -> Vec<(String, String)> {
    e.attributes()
        .filter_map(Result::ok)
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
            let value = a.unescape_value().unwrap_or_default().to_string();
            (key, value)
        })
        .collect()
}

/// Owns the in-progress payload for exactly one shape from the decoder
/// catalogue (spec §4.5).
struct Decoder {
    shape: Shape,
    id: String,
    state: DecodeState,

    // items-received / item-recent-get
    event: Option<String>,
    transducers: Vec<TransducerReading>,

    // subscriptions / affiliations
    subscriptions: Vec<Subscription>,
    affiliations: Vec<AffiliationEntry>,

    // collections
    collections: Vec<CollectionEntry>,
    capturing_collection_value: bool,

    // meta
    meta: Meta,
    current_transducer_meta: Option<usize>,
    geoloc_target: Option<GeolocTarget>,
    geoloc_field: Option<String>,

    // node-type
    node_type: NodeType,

    // references
    references: Vec<Reference>,

    // schedule
    schedule: Vec<ScheduleEvent>,
    current_event: Option<ScheduleEvent>,
    recurrence_field: Option<String>,

    // universal error
    error: Option<(i32, String)>,
    error_depth: Option<usize>,

    pending_error: Option<ClientError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeolocTarget {
    Meta,
    TransducerMeta,
}

impl Decoder {
    fn new(shape: Shape, id: impl Into<String>) -> Self {
        Self {
            shape,
            id: id.into(),
            state: DecodeState::new(),
            event: None,
            transducers: Vec::new(),
            subscriptions: Vec::new(),
            affiliations: Vec::new(),
            collections: Vec::new(),
            capturing_collection_value: false,
            meta: Meta::default(),
            current_transducer_meta: None,
            geoloc_target: None,
            geoloc_field: None,
            node_type: NodeType::Unknown,
            references: Vec::new(),
            schedule: Vec::new(),
            current_event: None,
            recurrence_field: None,
            error: None,
            error_depth: None,
            pending_error: None,
        }
    }

    fn on_start(&mut self, name: &str, attrs: Vec<(String, String)>) {
        self.state.push(name);

        if name == "error" {
            let code = attr(&attrs, "code").and_then(|c| c.parse().ok()).unwrap_or(0);
            let description = attr(&attrs, "type").unwrap_or("").to_string();
            self.error = Some((code, description));
            self.error_depth = Some(self.state.depth);
            return;
        }

        match self.shape {
            Shape::ItemsReceived | Shape::ItemRecentGet => self.on_start_data(name, &attrs),
            Shape::Subscriptions => self.on_start_subscriptions(name, &attrs),
            Shape::Affiliations => self.on_start_affiliations(name, &attrs),
            Shape::CollectionChildren => self.on_start_collection_children(name, &attrs),
            // entering/leaving character-data capture for the
            // `pubsub#collection` field is handled by
            // `maybe_enter_collection_field` and `on_end`.
            Shape::CollectionParents => {}
            Shape::Meta => self.on_start_meta(name, &attrs),
            Shape::NodeType => self.on_start_node_type(name, &attrs),
            Shape::References => self.on_start_references(name, &attrs),
            Shape::Schedule => self.on_start_schedule(name, &attrs),
        }
    }

    fn on_start_data(&mut self, name: &str, attrs: &[(String, String)]) {
        match name {
            "items" => self.event = attr(attrs, "node").map(str::to_string),
            "transducerData" | "transducerSetData" => {
                let kind = if name == "transducerData" {
                    TransducerKind::Single
                } else {
                    TransducerKind::Set
                };
                let Some(tname) = attr(attrs, "name") else {
                    self.pending_error = Some(ClientError::TransducerNullName);
                    return;
                };
                let Some(value) = attr(attrs, "value") else {
                    self.pending_error = Some(ClientError::TransducerNullValue);
                    return;
                };
                let timestamp = attr(attrs, "timestamp").unwrap_or("").to_string();
                self.transducers.push(TransducerReading {
                    kind,
                    name: tname.to_string(),
                    value: value.to_string(),
                    timestamp,
                });
            }
            _ => {}
        }
    }

    fn on_start_subscriptions(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "subscription" {
            let node = resolve_jid_or_node(attrs).unwrap_or_default();
            let jid = attr(attrs, "jid").unwrap_or("").to_string();
            let subid = attr(attrs, "subid").map(str::to_string);
            self.subscriptions.push(Subscription { node, jid, subid });
        }
    }

    fn on_start_affiliations(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "affiliation" {
            let node = attr(attrs, "node").unwrap_or("").to_string();
            let jid = attr(attrs, "jid").unwrap_or("").to_string();
            let raw = attr(attrs, "affiliation").unwrap_or("");
            match crate::model::Affiliation::parse(raw) {
                Some(affiliation) => self.affiliations.push(AffiliationEntry { node, jid, affiliation }),
                None => self.pending_error = Some(ClientError::UnknownAffiliationKind(raw.to_string())),
            }
        }
    }

    fn on_start_collection_children(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "item" && self.state.parent() == Some("query") {
            let node = attr(attrs, "node").unwrap_or("").to_string();
            let name = attr(attrs, "name").map(str::to_string);
            self.collections.push(CollectionEntry { node, name });
        }
    }

    fn on_start_meta(&mut self, name: &str, attrs: &[(String, String)]) {
        match name {
            "meta" => {
                self.meta.kind = attr(attrs, "type").map(MetaKind::parse);
                self.meta.name = attr(attrs, "name").map(str::to_string);
                self.meta.timestamp = attr(attrs, "timestamp").map(str::to_string);
                self.meta.info = attr(attrs, "info").map(str::to_string);
            }
            "transducer" => {
                let mut td = TransducerMeta::default();
                td.name = attr(attrs, "name").unwrap_or("").to_string();
                td.min = attr(attrs, "min").map(str::to_string);
                td.max = attr(attrs, "max").map(str::to_string);
                td.resolution = attr(attrs, "resolution").map(str::to_string);
                td.precision = attr(attrs, "precision").map(str::to_string);
                td.accuracy = attr(attrs, "accuracy").map(str::to_string);
                td.unit = attr(attrs, "unit").map(str::to_string);
                td.interface = attr(attrs, "interface").map(str::to_string);
                td.manufacturer = attr(attrs, "manufacturer").map(str::to_string);
                td.serial = attr(attrs, "serial").map(str::to_string);
                self.meta.transducer_meta.push(td);
                self.current_transducer_meta = Some(self.meta.transducer_meta.len() - 1);
            }
            "map" => {
                if let Some(idx) = self.current_transducer_meta {
                    if let (Some(name), Some(value)) = (attr(attrs, "name"), attr(attrs, "value")) {
                        self.meta.transducer_meta[idx]
                            .enumeration
                            .insert(name.to_string(), value.to_string());
                    }
                }
            }
            "property" => {
                let Some(name) = attr(attrs, "name") else { return };
                let value = attr(attrs, "value").unwrap_or("").to_string();
                let property = Property { name: name.to_string(), value };
                if self.state.parent() == Some("transducer") {
                    if let Some(idx) = self.current_transducer_meta {
                        self.meta.transducer_meta[idx].properties.push(property);
                    }
                } else {
                    self.meta.properties.push(property);
                }
            }
            "geoloc" => {
                self.geoloc_target = Some(if self.state.previous_element == "transducer" {
                    GeolocTarget::TransducerMeta
                } else {
                    GeolocTarget::Meta
                });
                let geo = Geolocation::default();
                match self.geoloc_target {
                    Some(GeolocTarget::TransducerMeta) => {
                        if let Some(idx) = self.current_transducer_meta {
                            self.meta.transducer_meta[idx].geolocation = Some(geo);
                        }
                    }
                    _ => self.meta.geolocation = Some(geo),
                }
            }
            "lat" | "lon" | "alt" | "accuracy" if self.geoloc_target.is_some() => {
                self.geoloc_field = Some(name.to_string());
            }
            _ => {}
        }
    }

    fn on_start_node_type(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "identity" {
            self.node_type = match attr(attrs, "type") {
                Some("leaf") => NodeType::Leaf,
                Some("collection") => NodeType::Collection,
                _ => NodeType::Unknown,
            };
        }
    }

    fn on_start_references(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "reference" {
            let kind = attr(attrs, "type").map(ReferenceKind::parse).unwrap_or(ReferenceKind::Unknown);
            let referenced_meta_kind = match attr(attrs, "metaType") {
                Some("device") => MetaKind::Device,
                Some("location") => MetaKind::Location,
                _ => MetaKind::Unknown,
            };
            let node_id = attr(attrs, "node").unwrap_or("").to_string();
            let display_name = attr(attrs, "name").map(str::to_string);
            self.references.push(Reference { kind, node_id, display_name, referenced_meta_kind });
        }
    }

    fn on_start_schedule(&mut self, name: &str, attrs: &[(String, String)]) {
        match name {
            "event" => {
                let id = attr(attrs, "id").and_then(|v| v.parse().ok()).unwrap_or(0);
                let time = attr(attrs, "time").unwrap_or("").to_string();
                let info = attr(attrs, "info").map(str::to_string);
                let transducer_name = attr(attrs, "transducerName").unwrap_or("").to_string();
                let transducer_value = attr(attrs, "transducerValue").unwrap_or("").to_string();
                self.current_event = Some(ScheduleEvent {
                    id,
                    transducer_name,
                    transducer_value,
                    time,
                    info,
                    recurrence: None,
                });
            }
            "recurrence" => {
                if let Some(event) = &mut self.current_event {
                    event.recurrence = Some(Recurrence::default());
                }
            }
            "freq" | "interval" | "count" | "until" | "bymonth" | "byday" | "exdate"
                if self.current_event.as_ref().is_some_and(|e| e.recurrence.is_some()) =>
            {
                self.recurrence_field = Some(name.to_string());
            }
            _ => {}
        }
    }

    fn on_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if self.error_depth.is_some() {
            if let Some((_, description)) = &mut self.error {
                if description.is_empty() {
                    *description = text.to_string();
                }
            }
            return;
        }

        match self.shape {
            Shape::CollectionParents if self.capturing_collection_value => {
                self.collections.push(CollectionEntry { node: text.to_string(), name: None });
            }
            Shape::Meta => {
                if let Some(field) = self.geoloc_field.take() {
                    let target = match self.geoloc_target {
                        Some(GeolocTarget::TransducerMeta) => {
                            self.current_transducer_meta.and_then(|idx| {
                                self.meta.transducer_meta[idx].geolocation.as_mut()
                            })
                        }
                        _ => self.meta.geolocation.as_mut(),
                    };
                    if let Some(geo) = target {
                        let slot = match field.as_str() {
                            "lat" => &mut geo.lat,
                            "lon" => &mut geo.lon,
                            "alt" => &mut geo.alt,
                            "accuracy" => &mut geo.accuracy,
                            _ => return,
                        };
                        *slot = Some(text.to_string());
                    }
                }
            }
            Shape::Schedule => {
                if let Some(field) = self.recurrence_field.take() {
                    if let Some(event) = &mut self.current_event {
                        if let Some(rec) = &mut event.recurrence {
                            match field.as_str() {
                                "freq" => rec.freq = Some(text.to_string()),
                                "interval" => rec.interval = text.parse().ok(),
                                "count" => rec.count = text.parse().ok(),
                                "until" => rec.until = Some(text.to_string()),
                                "bymonth" => rec.bymonth = Some(text.to_string()),
                                "byday" => rec.byday = Some(text.to_string()),
                                "exdate" => rec.exdate.push(text.to_string()),
                                _ => {}
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn on_end(&mut self, name: &str) {
        if self.error_depth == Some(self.state.depth) {
            self.error_depth = None;
        }

        if self.shape == Shape::CollectionParents && name == "field" {
            self.capturing_collection_value = false;
        }
        if name == "event" {
            if let Some(event) = self.current_event.take() {
                self.schedule.push(event);
            }
        }

        self.state.pop();
    }

    /// Handles `<field var="pubsub#collection">` turning on character-data
    /// capture for its child `<value>` elements (spec §4.5). Needs
    /// attribute access, so it runs from `on_start` before the generic
    /// dispatch strips them.
    fn maybe_enter_collection_field(&mut self, name: &str, attrs: &[(String, String)]) {
        if self.shape == Shape::CollectionParents
            && name == "field"
            && attr(attrs, "var") == Some("pubsub#collection")
        {
            self.capturing_collection_value = true;
        }
    }

    fn finish(mut self) -> ClientResult<Response> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }

        let payload = if let Some((code, description)) = self.error {
            PacketVariant::Error { code, description }
        } else {
            match self.shape {
                Shape::ItemsReceived | Shape::ItemRecentGet => PacketVariant::Data {
                    event: self.event,
                    transducers: self.transducers,
                },
                Shape::Subscriptions => PacketVariant::Subscriptions(self.subscriptions),
                Shape::Affiliations => PacketVariant::Affiliations(self.affiliations),
                Shape::CollectionChildren | Shape::CollectionParents => {
                    PacketVariant::Collections(self.collections)
                }
                Shape::Meta => PacketVariant::Meta(self.meta),
                Shape::NodeType => PacketVariant::NodeType(self.node_type),
                Shape::References => PacketVariant::References(self.references),
                Shape::Schedule => PacketVariant::Schedule(self.schedule),
            }
        };

        Ok(Response {
            id: self.id,
            namespace: None,
            element_name: None,
            type_attr: None,
            payload,
            stanza: None,
        })
    }
}

/// Decodes `xml` according to `shape`, returning a [`Response`] correlated
/// to `id`. An `<error/>` element anywhere in the document overrides the
/// shape-specific payload with [`PacketVariant::Error`], per spec §4.5's
/// universal error decoder.
pub fn decode(xml: &[u8], id: &str, shape: Shape) -> ClientResult<Response> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut decoder = Decoder::new(shape, id);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = read_attrs(&e);
                decoder.maybe_enter_collection_field(&name, &attrs);
                decoder.on_start(&name, attrs);
            }
            Ok(Event::Empty(e)) => {
                // quick_xml never emits a matching `End` for a self-closing
                // tag, so synthesize one immediately.
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = read_attrs(&e);
                decoder.maybe_enter_collection_field(&name, &attrs);
                decoder.on_start(&name, attrs);
                decoder.on_end(&name);
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                decoder.on_text(&text);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                decoder.on_end(&name);
            }
            Ok(_) => {}
            Err(e) => return Err(ClientError::ParserFailure(e.to_string())),
        }
        buf.clear();
    }

    decoder.finish()
}
