//! The Sync command.
//!
//! Parses the request per collection, runs the state machine, builds the
//! response batch, and keeps the two-phase-commit promise: the encoded
//! response is cached in the state row before it leaves the handler, and
//! a retry with the old key is answered from that cache byte-for-byte.

use std::sync::Arc;

use anyhow::Result;

use esta_store::mail::{self, Email};
use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::body::{select_body, BodyPreference, SelectedBody};
use crate::eas::state::{Disposition, PendingBatch, SyncState, Triple};
use crate::eas::{
    format_server_id, parse_server_id, CommandOutcome, EasEngine, RequestContext, RequestLog,
};

#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub collection_id: String,
    pub sync_key: String,
    pub get_changes: bool,
    pub window_size: Option<u32>,
    pub body_prefs: Vec<BodyPreference>,
    pub client_commands: Vec<ClientCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Change { server_id: String, read: Option<bool> },
    Delete { server_id: String },
    Fetch { server_id: String },
}

/// One `<Collection>` as parsed. A malformed one (missing `CollectionId`
/// or `SyncKey`) is carried along so it can answer its own `Status=4`
/// without aborting the siblings.
enum ParsedCollection {
    Request(CollectionRequest),
    Malformed {
        collection_id: Option<String>,
        sync_key: Option<String>,
    },
}

pub async fn handle(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    let Some(doc) = doc.filter(|d| d.tag == "Sync") else {
        return envelope_error(log);
    };
    let Some(collections_el) = doc.child("Collections") else {
        return envelope_error(log);
    };

    // A <WindowSize> directly under <Sync> applies to every collection.
    let global_window = doc
        .child_text("WindowSize")
        .and_then(|w| w.parse::<u32>().ok());

    // A malformed <Collection> gets its own Status=4 element and must not
    // abort its well-formed siblings.
    let mut requests = Vec::new();
    for collection in collections_el.children_named("Collection") {
        match parse_collection(collection, global_window) {
            Some(creq) => requests.push(ParsedCollection::Request(creq)),
            None => requests.push(ParsedCollection::Malformed {
                collection_id: collection.child_text("CollectionId").map(str::to_string),
                sync_key: collection.child_text("SyncKey").map(str::to_string),
            }),
        }
    }
    if requests.is_empty() {
        return envelope_error(log);
    }

    log.sync_key_in = requests.iter().find_map(|p| match p {
        ParsedCollection::Request(creq) => Some(creq.sync_key.clone()),
        ParsedCollection::Malformed { sync_key, .. } => sync_key.clone(),
    });

    let well_formed: Vec<&CollectionRequest> = requests
        .iter()
        .filter_map(|p| match p {
            ParsedCollection::Request(creq) => Some(creq),
            ParsedCollection::Malformed { .. } => None,
        })
        .collect();

    // Lock every involved row for the whole read-modify-write, in a fixed
    // order so concurrent multi-collection requests cannot deadlock.
    let mut lock_order: Vec<usize> = (0..well_formed.len()).collect();
    lock_order.sort_by(|a, b| {
        well_formed[*a]
            .collection_id
            .cmp(&well_formed[*b].collection_id)
    });

    let mut guards = std::collections::HashMap::new();
    for idx in lock_order {
        let creq = well_formed[idx];
        let triple: Triple = (
            ctx.user.email.clone(),
            ctx.device_id.clone(),
            creq.collection_id.clone(),
        );
        if !guards.contains_key(&creq.collection_id) {
            let row = engine.sync_states.row(&triple);
            let guard = row.lock_owned().await;
            guards.insert(creq.collection_id.clone(), (triple, guard));
        }
    }

    // Idempotent resend: every collection retries its outstanding batch.
    // The cached document is replayed verbatim with no state change; this
    // is the rule that keeps retry storms loop-free. A malformed sibling
    // disqualifies the replay, its Status=4 is not in the cached bytes.
    let all_resend = well_formed.len() == requests.len()
        && well_formed.iter().all(|creq| {
            guards
                .get(&creq.collection_id)
                .map(|(_, st)| st.classify(&creq.sync_key) == Disposition::Resend)
                .unwrap_or(false)
        });
    if all_resend {
        let cached: Vec<&PendingBatch> = well_formed
            .iter()
            .filter_map(|creq| guards.get(&creq.collection_id))
            .filter_map(|(_, st)| st.pending.as_ref())
            .collect();
        if let Some(first) = cached.first() {
            if cached.iter().all(|p| p.wbxml == first.wbxml) {
                log.sync_key_out = Some(first.next_key.clone());
                log.status = Some("resend".to_string());
                return Ok(CommandOutcome::Wbxml(first.wbxml.clone()));
            }
        }
    }

    // Process collections in request order.
    let mut processed = Vec::new();
    for parsed in &requests {
        match parsed {
            ParsedCollection::Request(creq) => {
                let (_, state) = guards
                    .get_mut(&creq.collection_id)
                    .expect("row locked above");
                processed.push(process_collection(engine, ctx, creq, state)?);
            }
            ParsedCollection::Malformed {
                collection_id,
                sync_key,
            } => processed.push(malformed_collection(
                collection_id.as_deref(),
                sync_key.as_deref(),
            )),
        }
    }

    let mut collections_out = Element::new(pages::AIRSYNC, "Collections");
    for p in &processed {
        collections_out.push(p.element.clone());
    }
    let response = Element::new(pages::AIRSYNC, "Sync")
        .str("Status", "1")
        .node(collections_out);
    let bytes = wbxml::encode(&response)?;

    // Two-phase commit: install the encoded document as the pending batch
    // and write the row through to disk before the response leaves. A
    // crash after this point replays cleanly; a crash before it leaves
    // the old state intact.
    for (parsed, p) in requests.iter().zip(processed.iter()) {
        let ParsedCollection::Request(creq) = parsed else {
            continue;
        };
        if let Some((ids, max_email_id, next_key)) = &p.install {
            let (triple, state) = guards
                .get_mut(&creq.collection_id)
                .expect("row locked above");
            state.install(PendingBatch {
                wbxml: bytes.clone(),
                ids: ids.clone(),
                next_key: next_key.clone(),
                max_email_id: *max_email_id,
            });
            let snapshot = state.clone();
            engine.sync_states.persist(triple, &snapshot).await;
        }
    }

    log.sync_key_out = processed.first().and_then(|p| p.advertised_key.clone());
    log.status = Some(
        processed
            .first()
            .map(|p| p.status.to_string())
            .unwrap_or_else(|| "1".to_string()),
    );

    Ok(CommandOutcome::Wbxml(bytes))
}

fn envelope_error(log: &mut RequestLog) -> Result<CommandOutcome> {
    log.status = Some("4".to_string());
    let doc = Element::new(pages::AIRSYNC, "Sync").str("Status", "4");
    Ok(CommandOutcome::Wbxml(wbxml::encode(&doc)?))
}

struct ProcessedCollection {
    element: Element,
    /// `(ids, max_email_id, next_key)` when a fresh batch must be cached.
    install: Option<(Vec<u64>, u64, String)>,
    advertised_key: Option<String>,
    status: u8,
}

fn process_collection(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    creq: &CollectionRequest,
    state: &mut SyncState,
) -> Result<ProcessedCollection> {
    let Some(folder) = mail::folder(&creq.collection_id) else {
        return Ok(error_collection(creq, 4));
    };

    match state.classify(&creq.sync_key) {
        Disposition::Invalid => Ok(error_collection(creq, 3)),
        Disposition::Initial => {
            if state.cur_key != "0" {
                state.reset();
            }
            if ctx.strategy.needs_empty_initial_response {
                // Data starts flowing on the follow-up request.
                let element = Element::new(pages::AIRSYNC, "Collection")
                    .str("Class", folder.class)
                    .str("SyncKey", state.next_key.clone())
                    .str("CollectionId", creq.collection_id.clone())
                    .str("Status", "1");
                Ok(ProcessedCollection {
                    element,
                    install: Some((vec![], state.cursor, state.next_key.clone())),
                    advertised_key: Some(state.next_key.clone()),
                    status: 1,
                })
            } else {
                build_batch(engine, ctx, creq, state, folder, true)
            }
        }
        Disposition::Ack => {
            state.commit();
            apply_client_commands(engine, ctx, creq);
            build_batch(engine, ctx, creq, state, folder, false)
        }
        Disposition::Fresh => {
            apply_client_commands(engine, ctx, creq);
            build_batch(engine, ctx, creq, state, folder, false)
        }
        Disposition::Resend => match state.pending.clone() {
            // Reached only when another collection in the same request is
            // not retrying. Reproduce the outstanding batch from its id
            // list; the state row stays untouched.
            Some(pending) => rebuild_from_pending(engine, ctx, creq, folder, &pending),
            None => Ok(error_collection(creq, 5)),
        },
    }
}

/// Status=4 element for a `<Collection>` that could not even be parsed,
/// echoing whatever identifying text it did carry.
fn malformed_collection(
    collection_id: Option<&str>,
    sync_key: Option<&str>,
) -> ProcessedCollection {
    let mut element = Element::new(pages::AIRSYNC, "Collection");
    if let Some(key) = sync_key {
        element = element.str("SyncKey", key);
    }
    if let Some(id) = collection_id {
        element = element.str("CollectionId", id);
    }
    element = element.str("Status", "4");
    ProcessedCollection {
        element,
        install: None,
        advertised_key: None,
        status: 4,
    }
}

fn error_collection(creq: &CollectionRequest, status: u8) -> ProcessedCollection {
    let element = Element::new(pages::AIRSYNC, "Collection")
        .str("SyncKey", creq.sync_key.clone())
        .str("CollectionId", creq.collection_id.clone())
        .str("Status", status.to_string());
    ProcessedCollection {
        element,
        install: None,
        advertised_key: None,
        status,
    }
}

/// Select emails past the cursor, apply window and byte budget, and build
/// the `<Collection>` subtree advertising `state.next_key`.
fn build_batch(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    creq: &CollectionRequest,
    state: &mut SyncState,
    folder: &mail::Folder,
    is_initial: bool,
) -> Result<ProcessedCollection> {
    let window = ctx.strategy.clamp_window(creq.window_size) as usize;

    // Non-email classes have nothing to offer yet; they sync empty so
    // calendar- and contact-capable clients stay happy.
    let candidates = if folder.class == "Email" && creq.get_changes {
        engine
            .store
            .list_emails(&ctx.user.email, &creq.collection_id, state.cursor, window + 1)
    } else {
        vec![]
    };

    let window_leftover = candidates.len() > window;
    let mut adds = Vec::new();
    let mut ids = Vec::new();
    let mut budget_spent = 0usize;
    let mut budget_leftover = false;

    for email in candidates.iter().take(window) {
        let selected = select_body(email, &creq.body_prefs, ctx.strategy, is_initial);
        let add = add_command(&creq.collection_id, email, &selected);
        // Budget on encoded size; a batch whose first email alone blows
        // the budget still ships it, progress beats the cap.
        let cost = wbxml::encode(&add)?.len();
        if !adds.is_empty() && budget_spent + cost > ctx.strategy.batch_byte_budget {
            budget_leftover = true;
            break;
        }
        budget_spent += cost;
        ids.push(email.id);
        adds.push(add);
    }

    let more_available = window_leftover || budget_leftover;
    let max_email_id = ids.iter().copied().max().unwrap_or(state.cursor);
    let responses = command_responses(engine, ctx, creq);

    let mut element = Element::new(pages::AIRSYNC, "Collection")
        .str("Class", folder.class)
        .str("SyncKey", state.next_key.clone())
        .str("CollectionId", creq.collection_id.clone())
        .str("Status", "1");
    // Ordering is load-bearing: MoreAvailable must precede Commands.
    if more_available {
        element = element.empty("MoreAvailable");
    }
    if let Some(responses) = responses {
        element = element.node(responses);
    }
    if !adds.is_empty() {
        let mut commands = Element::new(pages::AIRSYNC, "Commands");
        for add in adds {
            commands.push(add);
        }
        element = element.node(commands);
    }

    Ok(ProcessedCollection {
        element,
        install: Some((ids, max_email_id, state.next_key.clone())),
        advertised_key: Some(state.next_key.clone()),
        status: 1,
    })
}

fn rebuild_from_pending(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    creq: &CollectionRequest,
    folder: &mail::Folder,
    pending: &PendingBatch,
) -> Result<ProcessedCollection> {
    let mut adds = Vec::new();
    for id in &pending.ids {
        // Covered emails may have been deleted since; their ACK still
        // advances state, so skipping here is fine.
        if let Some(email) = engine.store.fetch_email(&ctx.user.email, *id) {
            let selected = select_body(&email, &creq.body_prefs, ctx.strategy, false);
            adds.push(add_command(&creq.collection_id, &email, &selected));
        }
    }
    let more_available = engine
        .store
        .count_since(&ctx.user.email, &creq.collection_id, pending.max_email_id)
        > 0;

    let mut element = Element::new(pages::AIRSYNC, "Collection")
        .str("Class", folder.class)
        .str("SyncKey", pending.next_key.clone())
        .str("CollectionId", creq.collection_id.clone())
        .str("Status", "1");
    if more_available {
        element = element.empty("MoreAvailable");
    }
    if !adds.is_empty() {
        let mut commands = Element::new(pages::AIRSYNC, "Commands");
        for add in adds {
            commands.push(add);
        }
        element = element.node(commands);
    }

    Ok(ProcessedCollection {
        element,
        install: None,
        advertised_key: Some(pending.next_key.clone()),
        status: 1,
    })
}

/// Flag changes and deletions uploaded by the client.
fn apply_client_commands(engine: &Arc<EasEngine>, ctx: &RequestContext, creq: &CollectionRequest) {
    for command in &creq.client_commands {
        match command {
            ClientCommand::Change { server_id, read } => {
                if let (Some((_, id)), Some(read)) = (parse_server_id(server_id), read) {
                    if let Err(e) = engine.store.mark_read(&ctx.user.email, id, *read) {
                        tracing::debug!(err=%e, server_id=%server_id, "change on missing email");
                    }
                }
            }
            ClientCommand::Delete { server_id } => {
                if let Some((_, id)) = parse_server_id(server_id) {
                    if let Err(e) = engine.store.delete(&ctx.user.email, id) {
                        tracing::debug!(err=%e, server_id=%server_id, "delete on missing email");
                    }
                }
            }
            ClientCommand::Fetch { .. } => (),
        }
    }
}

/// `<Responses>` for the client's uploads: acknowledged changes and
/// fulfilled fetches. Deletes succeed silently.
fn command_responses(
    engine: &Arc<EasEngine>,
    ctx: &RequestContext,
    creq: &CollectionRequest,
) -> Option<Element> {
    let mut responses = Element::new(pages::AIRSYNC, "Responses");
    let mut any = false;

    for command in &creq.client_commands {
        match command {
            ClientCommand::Change { server_id, .. } => {
                responses.push(
                    Element::new(pages::AIRSYNC, "Change")
                        .str("ServerId", server_id.clone())
                        .str("Status", "1"),
                );
                any = true;
            }
            ClientCommand::Fetch { server_id } => {
                let fetched = parse_server_id(server_id)
                    .and_then(|(_, id)| engine.store.fetch_email(&ctx.user.email, id));
                let mut fetch = Element::new(pages::AIRSYNC, "Fetch")
                    .str("ServerId", server_id.clone());
                match fetched {
                    Some(email) => {
                        let full = select_body(&email, &full_body_prefs(&creq.body_prefs), ctx.strategy, false);
                        fetch = fetch
                            .str("Status", "1")
                            .node(application_data(&email, &full));
                    }
                    None => {
                        fetch = fetch.str("Status", "8");
                    }
                }
                responses.push(fetch);
                any = true;
            }
            ClientCommand::Delete { .. } => (),
        }
    }

    any.then_some(responses)
}

/// Fetch responses carry the whole body: same type selection, no cap.
fn full_body_prefs(prefs: &[BodyPreference]) -> Vec<BodyPreference> {
    prefs
        .iter()
        .map(|p| BodyPreference {
            body_type: p.body_type,
            truncation_size: None,
            all_or_none: p.all_or_none,
        })
        .collect()
}

fn add_command(collection_id: &str, email: &Email, body: &SelectedBody) -> Element {
    Element::new(pages::AIRSYNC, "Add")
        .str("ServerId", format_server_id(collection_id, email.id))
        .node(application_data(email, body))
}

fn application_data(email: &Email, body: &SelectedBody) -> Element {
    let mut app = Element::new(pages::AIRSYNC, "ApplicationData");
    if !email.to.is_empty() {
        app = app.str_on(pages::EMAIL, "To", email.to.clone());
    }
    if !email.from.is_empty() {
        app = app.str_on(pages::EMAIL, "From", email.from.clone());
    }
    app = app
        .str_on(pages::EMAIL, "Subject", email.subject.clone())
        .str_on(
            pages::EMAIL,
            "DateReceived",
            email
                .date_received
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
        )
        .str_on(pages::EMAIL, "DisplayTo", email.to.clone())
        .str_on(pages::EMAIL, "ThreadTopic", email.subject.clone())
        .str_on(pages::EMAIL, "Importance", "1")
        .str_on(pages::EMAIL, "Read", if email.is_read { "1" } else { "0" })
        .node(body_element(body))
        .str_on(
            pages::AIRSYNCBASE,
            "NativeBodyType",
            email.native_body_type().to_string(),
        )
        .str_on(pages::EMAIL, "MessageClass", email.message_class.clone())
        .str_on(pages::EMAIL, "InternetCPID", "65001")
        .str_on(pages::EMAIL, "ContentClass", "urn:content-classes:message");
    app
}

/// The `<Body>` container. Child order is fixed (Type, EstimatedDataSize,
/// Truncated, Data); `<Data>` is OPAQUE, never an inline string; and no
/// `<Preview>` may coexist with `<Data>`.
fn body_element(body: &SelectedBody) -> Element {
    Element::new(pages::AIRSYNCBASE, "Body")
        .str("Type", body.body_type.to_string())
        .str("EstimatedDataSize", body.estimated_size.to_string())
        .str("Truncated", if body.truncated { "1" } else { "0" })
        .opaque("Data", body.data.clone())
}

fn parse_collection(collection: &Element, global_window: Option<u32>) -> Option<CollectionRequest> {
    let collection_id = collection.child_text("CollectionId")?.to_string();
    let sync_key = collection.child_text("SyncKey")?.to_string();

    let get_changes = match collection.child("GetChanges") {
        Some(el) => el.text() != Some("0"),
        None => true,
    };
    let window_size = collection
        .child_text("WindowSize")
        .and_then(|w| w.parse::<u32>().ok())
        .or(global_window);

    let body_prefs = collection
        .child("Options")
        .map(|options| {
            options
                .children_named("BodyPreference")
                .filter_map(|bp| {
                    Some(BodyPreference {
                        body_type: bp.child_text("Type")?.parse().ok()?,
                        truncation_size: bp
                            .child_text("TruncationSize")
                            .and_then(|t| t.parse().ok()),
                        all_or_none: bp.child_text("AllOrNone") == Some("1"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut client_commands = Vec::new();
    if let Some(commands) = collection.child("Commands") {
        for change in commands.children_named("Change") {
            let Some(server_id) = change.child_text("ServerId") else {
                continue;
            };
            let read = change
                .child("ApplicationData")
                .and_then(|ad| ad.child_text("Read"))
                .map(|r| r == "1");
            client_commands.push(ClientCommand::Change {
                server_id: server_id.to_string(),
                read,
            });
        }
        for delete in commands.children_named("Delete") {
            if let Some(server_id) = delete.child_text("ServerId") {
                client_commands.push(ClientCommand::Delete {
                    server_id: server_id.to_string(),
                });
            }
        }
        for fetch in commands.children_named("Fetch") {
            if let Some(server_id) = fetch.child_text("ServerId") {
                client_commands.push(ClientCommand::Fetch {
                    server_id: server_id.to_string(),
                });
            }
        }
    }

    Some(CollectionRequest {
        collection_id,
        sync_key,
        get_changes,
        window_size,
        body_prefs,
        client_commands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eas::strategy::ClientStrategy;
    use esta_store::mail::store::{Envelope, MailStore};
    use esta_store::notify::ChangeBus;
    use esta_store::oof::OofRegistry;
    use esta_user::config::AutodiscoverConfig;
    use esta_user::login::static_provider::StaticLoginProvider;

    const ALICE: &str = "alice@example.tld";

    fn engine() -> Arc<EasEngine> {
        let login = Arc::new(
            StaticLoginProvider::from_clear_entries(&[(ALICE, "hunter2")]).unwrap(),
        );
        let bus = ChangeBus::new();
        let store = MailStore::new(bus);
        EasEngine::new(
            login,
            store,
            Arc::new(OofRegistry::new()),
            AutodiscoverConfig::default(),
            None,
        )
    }

    fn ctx(user_agent: &str, device_type: &str) -> RequestContext {
        RequestContext {
            user: esta_user::login::UserProfile {
                email: ALICE.to_string(),
                display_name: None,
            },
            device_id: "DEV1".to_string(),
            device_type: device_type.to_string(),
            user_agent: user_agent.to_string(),
            protocol_version: "14.1".to_string(),
            policy_key_header: None,
            strategy: ClientStrategy::detect(user_agent, device_type),
        }
    }

    fn deliver(engine: &Arc<EasEngine>, n: usize, body: &str) {
        for i in 0..n {
            let raw = format!(
                "From: bob@example.tld\r\nTo: {ALICE}\r\nSubject: msg {i}\r\n\r\n{body}\r\n"
            );
            engine.store.ingest(
                raw.as_bytes(),
                &Envelope {
                    from: Some("bob@example.tld".into()),
                    to: vec![ALICE.to_string()],
                },
            );
        }
    }

    fn sync_doc(sync_key: &str, window: Option<u32>, prefs: &[(u8, Option<u32>)]) -> Element {
        let mut collection = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", sync_key)
            .str("CollectionId", "1")
            .empty("GetChanges");
        if let Some(w) = window {
            collection = collection.str("WindowSize", w.to_string());
        }
        if !prefs.is_empty() {
            let mut options = Element::new(pages::AIRSYNC, "Options");
            for (t, trunc) in prefs {
                let mut bp = Element::new(pages::AIRSYNCBASE, "BodyPreference")
                    .str("Type", t.to_string());
                if let Some(trunc) = trunc {
                    bp = bp.str("TruncationSize", trunc.to_string());
                }
                options.push(bp);
            }
            collection = collection.node(options);
        }
        Element::new(pages::AIRSYNC, "Sync")
            .node(Element::new(pages::AIRSYNC, "Collections").node(collection))
    }

    async fn run(
        engine: &Arc<EasEngine>,
        ctx: &RequestContext,
        doc: &Element,
    ) -> (Vec<u8>, Element) {
        let mut log = RequestLog::default();
        let outcome = handle(engine, ctx, Some(doc), &mut log).await.unwrap();
        match outcome {
            CommandOutcome::Wbxml(bytes) => {
                let parsed = wbxml::decode(&bytes).unwrap();
                (bytes, parsed)
            }
            _ => panic!("sync always answers with wbxml"),
        }
    }

    fn collection<'a>(parsed: &'a Element) -> &'a Element {
        parsed
            .child("Collections")
            .unwrap()
            .child("Collection")
            .unwrap()
    }

    #[tokio::test]
    async fn outlook_initial_is_empty_then_data_flows() {
        let engine = engine();
        deliver(&engine, 3, "body");
        let ctx = ctx("Microsoft Office Outlook", "WindowsOutlook");

        let (_, first) = run(&engine, &ctx, &sync_doc("0", Some(25), &[])).await;
        let coll = collection(&first);
        assert_eq!(coll.child_text("SyncKey"), Some("1"));
        assert_eq!(coll.child_text("Status"), Some("1"));
        assert_eq!(coll.child_text("Class"), Some("Email"));
        assert!(coll.child("Commands").is_none());

        let (_, second) = run(&engine, &ctx, &sync_doc("1", Some(25), &[])).await;
        let coll = collection(&second);
        assert_eq!(coll.child_text("SyncKey"), Some("2"));
        let adds: Vec<_> = coll.child("Commands").unwrap().children_named("Add").collect();
        assert_eq!(adds.len(), 3);
        assert!(coll.child("MoreAvailable").is_none());
    }

    #[tokio::test]
    async fn ios_initial_sends_data_with_exact_truncation() {
        let engine = engine();
        deliver(&engine, 60, &"x".repeat(2000));
        let ctx = ctx("Apple-iPhone12C1/1905", "iPhone");

        let (_, parsed) = run(&engine, &ctx, &sync_doc("0", Some(50), &[(1, Some(500))])).await;
        let coll = collection(&parsed);
        assert_eq!(coll.child_text("SyncKey"), Some("1"));
        let adds: Vec<_> = coll.child("Commands").unwrap().children_named("Add").collect();
        assert_eq!(adds.len(), 50);
        assert!(coll.child("MoreAvailable").is_some());

        for add in adds {
            let body = add
                .child("ApplicationData")
                .unwrap()
                .child("Body")
                .unwrap();
            assert_eq!(body.child_text("Truncated"), Some("1"));
            let data = body.child("Data").unwrap().opaque_bytes().unwrap();
            assert_eq!(data.len(), 500);
            assert!(body.child("Preview").is_none());
            // full body length, not the truncated payload
            let est: usize = body.child_text("EstimatedDataSize").unwrap().parse().unwrap();
            assert!(est >= 2000);
        }
    }

    #[tokio::test]
    async fn idempotent_resend_is_byte_identical() {
        let engine = engine();
        deliver(&engine, 5, "payload");
        let ctx = ctx("Apple-iPhone12C1/1905", "iPhone");

        let (_, first) = run(&engine, &ctx, &sync_doc("0", Some(3), &[])).await;
        assert_eq!(collection(&first).child_text("SyncKey"), Some("1"));

        let (bytes_a, _) = run(&engine, &ctx, &sync_doc("1", Some(3), &[])).await;
        let (bytes_b, _) = run(&engine, &ctx, &sync_doc("1", Some(3), &[])).await;
        assert_eq!(bytes_a, bytes_b);

        // Even after new mail arrives, a retry replays the cached batch.
        deliver(&engine, 1, "late arrival");
        let (bytes_c, _) = run(&engine, &ctx, &sync_doc("1", Some(3), &[])).await;
        assert_eq!(bytes_a, bytes_c);
    }

    #[tokio::test]
    async fn unknown_key_reports_status_3_without_reset() {
        let engine = engine();
        deliver(&engine, 2, "body");
        let ctx = ctx("Android-Mail", "Android");

        let (_, first) = run(&engine, &ctx, &sync_doc("0", None, &[])).await;
        assert_eq!(collection(&first).child_text("SyncKey"), Some("1"));

        let (_, bad) = run(&engine, &ctx, &sync_doc("17", None, &[])).await;
        assert_eq!(collection(&bad).child_text("Status"), Some("3"));

        // The legitimate retry still works: state was not reset.
        let (_, retry) = run(&engine, &ctx, &sync_doc("0", None, &[])).await;
        assert_eq!(collection(&retry).child_text("Status"), Some("1"));
    }

    #[tokio::test]
    async fn pagination_drains_with_more_available_ordering() {
        let engine = engine();
        deliver(&engine, 7, "body");
        let ctx = ctx("Android-Mail", "Android");

        let mut key = "0".to_string();
        let mut total = 0;
        for _ in 0..10 {
            let (_, parsed) = run(&engine, &ctx, &sync_doc(&key, Some(3), &[])).await;
            let coll = collection(&parsed);
            let adds = coll
                .child("Commands")
                .map(|c| c.children_named("Add").count())
                .unwrap_or(0);
            total += adds;

            // MoreAvailable, when present, precedes Commands.
            if coll.child("MoreAvailable").is_some() {
                let child_tags: Vec<&str> = coll
                    .children
                    .iter()
                    .filter_map(|n| match n {
                        esta_wbxml::Node::Elem(e) => Some(e.tag),
                        _ => None,
                    })
                    .collect();
                let more_at = child_tags.iter().position(|t| *t == "MoreAvailable").unwrap();
                let commands_at = child_tags.iter().position(|t| *t == "Commands").unwrap();
                assert!(more_at < commands_at);
            }

            key = coll.child_text("SyncKey").unwrap().to_string();
            if coll.child("MoreAvailable").is_none() {
                break;
            }
        }
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn oversized_first_email_still_ships() {
        let engine = engine();
        // One email far past the 50 KB budget, untruncated.
        deliver(&engine, 1, &"y".repeat(200 * 1024));
        deliver(&engine, 1, "small");
        let ctx = ctx("Android-Mail", "Android");

        let (_, parsed) = run(&engine, &ctx, &sync_doc("0", Some(25), &[])).await;
        let coll = collection(&parsed);
        let adds = coll.child("Commands").unwrap().children_named("Add").count();
        assert_eq!(adds, 1);
        assert!(coll.child("MoreAvailable").is_some());
    }

    #[tokio::test]
    async fn client_delete_is_processed() {
        let engine = engine();
        deliver(&engine, 1, "to be deleted");
        let ctx = ctx("Android-Mail", "Android");

        let (_, first) = run(&engine, &ctx, &sync_doc("0", None, &[])).await;
        assert_eq!(collection(&first).child_text("SyncKey"), Some("1"));

        let delete = Element::new(pages::AIRSYNC, "Delete").str("ServerId", "1:1");
        let coll = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", "1")
            .str("CollectionId", "1")
            .node(Element::new(pages::AIRSYNC, "Commands").node(delete));
        let doc = Element::new(pages::AIRSYNC, "Sync")
            .node(Element::new(pages::AIRSYNC, "Collections").node(coll));
        run(&engine, &ctx, &doc).await;

        let email = engine.store.fetch_email(ALICE, 1).unwrap();
        assert_eq!(email.folder_id, mail::DELETED);
    }

    #[tokio::test]
    async fn change_command_gets_a_response() {
        let engine = engine();
        deliver(&engine, 1, "mark me");
        let ctx = ctx("Android-Mail", "Android");

        run(&engine, &ctx, &sync_doc("0", None, &[])).await;

        let change = Element::new(pages::AIRSYNC, "Change")
            .str("ServerId", "1:1")
            .node(
                Element::new(pages::AIRSYNC, "ApplicationData").str_on(pages::EMAIL, "Read", "1"),
            );
        let coll = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", "1")
            .str("CollectionId", "1")
            .node(Element::new(pages::AIRSYNC, "Commands").node(change));
        let doc = Element::new(pages::AIRSYNC, "Sync")
            .node(Element::new(pages::AIRSYNC, "Collections").node(coll));
        let (_, parsed) = run(&engine, &ctx, &doc).await;

        let responses = collection(&parsed).child("Responses").unwrap();
        let change_resp = responses.child("Change").unwrap();
        assert_eq!(change_resp.child_text("ServerId"), Some("1:1"));
        assert_eq!(change_resp.child_text("Status"), Some("1"));
        assert!(engine.store.fetch_email(ALICE, 1).unwrap().is_read);
    }

    #[tokio::test]
    async fn multi_collection_requests_are_processed_independently() {
        let engine = engine();
        deliver(&engine, 2, "body");
        let ctx = ctx("Android-Mail", "Android");

        let email_coll = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", "0")
            .str("CollectionId", "1")
            .empty("GetChanges");
        let calendar_coll = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Calendar")
            .str("SyncKey", "0")
            .str("CollectionId", "6");
        let doc = Element::new(pages::AIRSYNC, "Sync").node(
            Element::new(pages::AIRSYNC, "Collections")
                .node(email_coll)
                .node(calendar_coll),
        );

        let (_, parsed) = run(&engine, &ctx, &doc).await;
        let colls: Vec<_> = parsed
            .child("Collections")
            .unwrap()
            .children_named("Collection")
            .collect();
        assert_eq!(colls.len(), 2);

        let email = colls
            .iter()
            .find(|c| c.child_text("CollectionId") == Some("1"))
            .unwrap();
        assert_eq!(email.child_text("Status"), Some("1"));
        assert_eq!(email.child("Commands").unwrap().children_named("Add").count(), 2);

        // The calendar collection syncs empty but well-formed.
        let calendar = colls
            .iter()
            .find(|c| c.child_text("CollectionId") == Some("6"))
            .unwrap();
        assert_eq!(calendar.child_text("Class"), Some("Calendar"));
        assert_eq!(calendar.child_text("SyncKey"), Some("1"));
        assert_eq!(calendar.child_text("Status"), Some("1"));
        assert!(calendar.child("Commands").is_none());
    }

    #[tokio::test]
    async fn malformed_collection_does_not_abort_its_siblings() {
        let engine = engine();
        deliver(&engine, 2, "body");
        let ctx = ctx("Android-Mail", "Android");

        // No CollectionId: unparsable, but the inbox sibling must still
        // get its data.
        let broken = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", "0");
        let good = Element::new(pages::AIRSYNC, "Collection")
            .str("Class", "Email")
            .str("SyncKey", "0")
            .str("CollectionId", "1")
            .empty("GetChanges");
        let doc = Element::new(pages::AIRSYNC, "Sync").node(
            Element::new(pages::AIRSYNC, "Collections")
                .node(broken)
                .node(good),
        );

        let (_, parsed) = run(&engine, &ctx, &doc).await;
        assert_eq!(parsed.child_text("Status"), Some("1"));
        let colls: Vec<_> = parsed
            .child("Collections")
            .unwrap()
            .children_named("Collection")
            .collect();
        assert_eq!(colls.len(), 2);

        let broken = &colls[0];
        assert_eq!(broken.child_text("Status"), Some("4"));
        assert_eq!(broken.child_text("SyncKey"), Some("0"));
        assert!(broken.child("CollectionId").is_none());

        let good = &colls[1];
        assert_eq!(good.child_text("CollectionId"), Some("1"));
        assert_eq!(good.child_text("Status"), Some("1"));
        assert_eq!(good.child_text("SyncKey"), Some("1"));
        assert_eq!(good.child("Commands").unwrap().children_named("Add").count(), 2);
    }

    #[tokio::test]
    async fn unknown_collection_is_a_protocol_error() {
        let engine = engine();
        let ctx = ctx("Android-Mail", "Android");
        let coll = Element::new(pages::AIRSYNC, "Collection")
            .str("SyncKey", "0")
            .str("CollectionId", "99");
        let doc = Element::new(pages::AIRSYNC, "Sync")
            .node(Element::new(pages::AIRSYNC, "Collections").node(coll));
        let (_, parsed) = run(&engine, &ctx, &doc).await;
        assert_eq!(collection(&parsed).child_text("Status"), Some("4"));
    }
}
