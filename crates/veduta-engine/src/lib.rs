use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use veduta_contracts::errors::{workflow_kind, WorkflowError};
use veduta_contracts::events::{EventPayload, EventWriter};
use veduta_contracts::handles::{HandleOrigin, HandleRegistry, ResourceHandle};
use veduta_contracts::prompts::{prompt_diff, strip_wrapping_quotes};
use veduta_contracts::runs::job::{GenerationJob, RunOutcome};
use veduta_contracts::runs::summary::{write_summary, LeakedHandle, SessionSummary};
use veduta_contracts::styles::{
    GalleryCommand, LoadTicket, LoadTracker, RebindOutcome, SelectedStyle, SelectionSync,
    StyleCatalog, StyleRecord,
};

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

/// Dev tunnels in front of the render service interstitial every request
/// without this header.
const TUNNEL_BYPASS_HEADER: &str = "bypass-tunnel-reminder";

const ERROR_BODY_MAX_CHARS: usize = 512;
const ERROR_EVENT_MAX_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub artifact_width: u32,
    pub artifact_height: u32,
    pub slot_count: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            artifact_width: 1080,
            artifact_height: 720,
            slot_count: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub sketch_name: String,
    pub sketch: Vec<u8>,
    pub style_name: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
}

/// The remote render service, reduced to the calls the workflow needs.
///
/// Implementations map transport failures to `NetworkFailure` and non-2xx
/// responses to the operation's own error kind; slot attribution for
/// generation failures is the engine's job, not the service's.
#[async_trait(?Send)]
pub trait RenderService {
    fn describe(&self) -> String;
    async fn list_styles(&self) -> Result<Vec<String>>;
    async fn fetch_style_image(&self, name: &str) -> Result<Vec<u8>>;
    async fn upload_style(&self, file_name: &str, bytes: Vec<u8>) -> Result<()>;
    async fn augment_prompt(&self, sketch_name: &str, sketch: &[u8], prompt: &str)
        -> Result<String>;
    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>>;
    async fn visit_counter(&self) -> Result<u64>;
}

pub struct HttpRenderService {
    base_url: String,
    http: HttpClient,
}

impl HttpRenderService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait(?Send)]
impl RenderService for HttpRenderService {
    fn describe(&self) -> String {
        format!("remote ({})", self.base_url)
    }

    async fn list_styles(&self) -> Result<Vec<String>> {
        let endpoint = self.endpoint("/api/get_styles/");
        let response = self
            .http
            .get(&endpoint)
            .header(TUNNEL_BYPASS_HEADER, "true")
            .send()
            .await
            .map_err(|err| network_failure("style list", err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(WorkflowError::CatalogUnavailable {
                reason: format!("status {code}: {}", truncate_text(&body, ERROR_BODY_MAX_CHARS)),
            });
        }
        let names: Vec<String> = response
            .json()
            .await
            .context("failed parsing style list JSON")?;
        Ok(names)
    }

    async fn fetch_style_image(&self, name: &str) -> Result<Vec<u8>> {
        let endpoint = self.endpoint("/api/get_style/");
        let response = self
            .http
            .get(&endpoint)
            .query(&[("name", name)])
            .header(TUNNEL_BYPASS_HEADER, "true")
            .send()
            .await
            .map_err(|err| network_failure("style image", err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(WorkflowError::StyleImageUnavailable {
                name: name.to_string(),
                reason: format!("status {code}: {}", truncate_text(&body, ERROR_BODY_MAX_CHARS)),
            });
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed reading style image bytes for '{name}'"))?;
        Ok(bytes.to_vec())
    }

    async fn upload_style(&self, file_name: &str, bytes: Vec<u8>) -> Result<()> {
        let endpoint = self.endpoint("/api/load_style/");
        let part = MultipartPart::bytes(bytes).file_name(file_name.to_string());
        let form = MultipartForm::new().part("image", part);
        let response = self
            .http
            .post(&endpoint)
            .header(TUNNEL_BYPASS_HEADER, "true")
            .multipart(form)
            .send()
            .await
            .map_err(|err| network_failure("style upload", err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(WorkflowError::UploadFailed {
                reason: format!("status {code}: {}", truncate_text(&body, ERROR_BODY_MAX_CHARS)),
            });
        }
        Ok(())
    }

    async fn augment_prompt(
        &self,
        sketch_name: &str,
        sketch: &[u8],
        prompt: &str,
    ) -> Result<String> {
        let endpoint = self.endpoint("/api/augment_prompt/");
        let part = MultipartPart::bytes(sketch.to_vec()).file_name(sketch_name.to_string());
        let form = MultipartForm::new()
            .part("sketch", part)
            .text("prompt", prompt.to_string());
        let response = self
            .http
            .post(&endpoint)
            .header(TUNNEL_BYPASS_HEADER, "true")
            .multipart(form)
            .send()
            .await
            .map_err(|err| network_failure("prompt augment", err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(WorkflowError::PromptAugmentFailed {
                reason: format!("status {code}: {}", truncate_text(&body, ERROR_BODY_MAX_CHARS)),
            });
        }
        let text = response
            .text()
            .await
            .context("failed reading augmented prompt")?;
        Ok(text)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>> {
        let endpoint = self.endpoint("/api/generate/");
        let part = MultipartPart::bytes(request.sketch.clone())
            .file_name(request.sketch_name.clone());
        let form = MultipartForm::new()
            .part("sketch", part)
            .text("style_name", request.style_name.clone())
            .text("prompt", request.prompt.clone())
            .text("width", request.width.to_string())
            .text("height", request.height.to_string());
        let response = self
            .http
            .post(&endpoint)
            .header(TUNNEL_BYPASS_HEADER, "true")
            .multipart(form)
            .send()
            .await
            .map_err(|err| network_failure("generate", err))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            bail!(
                "generate request failed ({code}): {}",
                truncate_text(&body, ERROR_BODY_MAX_CHARS)
            );
        }
        let bytes = response
            .bytes()
            .await
            .context("failed reading generated image bytes")?;
        Ok(bytes.to_vec())
    }

    async fn visit_counter(&self) -> Result<u64> {
        let endpoint = self.endpoint("/counter");
        let response = self
            .http
            .get(&endpoint)
            .header(TUNNEL_BYPASS_HEADER, "true")
            .send()
            .await
            .map_err(|err| network_failure("counter", err))?;
        if !response.status().is_success() {
            bail!(
                "counter request failed ({})",
                response.status().as_u16()
            );
        }
        let count: u64 = response
            .json()
            .await
            .context("failed parsing counter response")?;
        Ok(count)
    }
}

/// Offline backend: a seeded style set, solid-color thumbnails and artifacts
/// derived from input text, and a canned augment reply. Uploads extend the
/// style list so reload-after-upload works without a server.
pub struct DryrunRenderService {
    styles: RefCell<Vec<String>>,
}

impl DryrunRenderService {
    pub fn new() -> Self {
        Self {
            styles: RefCell::new((0..5).map(|index| format!("{index}.jpg")).collect()),
        }
    }
}

impl Default for DryrunRenderService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl RenderService for DryrunRenderService {
    fn describe(&self) -> String {
        "dryrun".to_string()
    }

    async fn list_styles(&self) -> Result<Vec<String>> {
        Ok(self.styles.borrow().clone())
    }

    async fn fetch_style_image(&self, name: &str) -> Result<Vec<u8>> {
        if !self.styles.borrow().iter().any(|style| style == name) {
            bail!(WorkflowError::StyleImageUnavailable {
                name: name.to_string(),
                reason: "unknown style".to_string(),
            });
        }
        encode_solid_png(96, 64, color_from_text(name))
    }

    async fn upload_style(&self, file_name: &str, _bytes: Vec<u8>) -> Result<()> {
        let mut styles = self.styles.borrow_mut();
        if !styles.iter().any(|style| style == file_name) {
            styles.push(file_name.to_string());
        }
        Ok(())
    }

    async fn augment_prompt(
        &self,
        _sketch_name: &str,
        _sketch: &[u8],
        prompt: &str,
    ) -> Result<String> {
        let base = prompt.trim();
        if base.is_empty() {
            Ok("\"architectural render, golden hour, high detail\"".to_string())
        } else {
            Ok(format!(
                "\"{base}, architectural render, golden hour, high detail\""
            ))
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Vec<u8>> {
        let seed = format!("{}|{}", request.style_name, request.prompt);
        encode_solid_png(request.width, request.height, color_from_text(&seed))
    }

    async fn visit_counter(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Catalog lifecycle as the session surfaces see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

impl CatalogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Fetched but not yet installed catalog payload. No display handles exist
/// at this point, so dropping a superseded or failed fetch leaks nothing.
#[derive(Debug)]
pub struct CatalogFetch {
    entries: Vec<(String, Vec<u8>)>,
}

impl CatalogFetch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogInstall {
    Installed { styles: usize },
    Superseded,
}

#[derive(Debug, Clone)]
pub struct SketchAttachment {
    pub name: String,
    pub handle: ResourceHandle,
}

/// Owns the whole client-side workflow state: service backend, handle
/// registry, catalog, selection, prompt, result slots, and the event log.
/// Every field is mutated only through the methods below; the CLI is a thin
/// driver around them.
pub struct StudioEngine {
    service: Box<dyn RenderService>,
    session_dir: PathBuf,
    events: EventWriter,
    summary_path: PathBuf,
    started_at: String,
    config: RenderConfig,
    registry: HandleRegistry,
    catalog: StyleCatalog,
    catalog_state: CatalogState,
    catalog_error: Option<String>,
    loads: LoadTracker,
    selection: SelectionSync,
    sketch: Option<SketchAttachment>,
    prompt: String,
    results: Vec<Option<ResourceHandle>>,
    job: Option<GenerationJob>,
    generating: bool,
    total_runs: u64,
    total_artifacts: u64,
}

impl StudioEngine {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        service: Box<dyn RenderService>,
        config: RenderConfig,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_id = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(events_path.into(), session_id);
        let summary_path = session_dir.join("summary.json");
        let started_at = now_utc_iso();
        let results = vec![None; config.slot_count];

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": session_dir.to_string_lossy().to_string(),
                "service": service.describe(),
                "slots": config.slot_count,
            })),
        )?;

        Ok(Self {
            service,
            session_dir,
            events,
            summary_path,
            started_at,
            config,
            registry: HandleRegistry::new(),
            catalog: StyleCatalog::default(),
            catalog_state: CatalogState::NotLoaded,
            catalog_error: None,
            loads: LoadTracker::new(),
            selection: SelectionSync::new(),
            sketch: None,
            prompt: String::new(),
            results,
            job: None,
            generating: false,
            total_runs: 0,
            total_artifacts: 0,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn service_description(&self) -> String {
        self.service.describe()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn emit_event(&self, event_type: &str, payload: EventPayload) -> Result<Value> {
        self.events.emit(event_type, payload)
    }

    pub fn catalog(&self) -> &StyleCatalog {
        &self.catalog
    }

    pub fn catalog_state(&self) -> CatalogState {
        self.catalog_state
    }

    pub fn catalog_error(&self) -> Option<&str> {
        self.catalog_error.as_deref()
    }

    pub fn gallery_position(&self) -> usize {
        self.selection.position()
    }

    pub fn selected_style(&self) -> Option<&SelectedStyle> {
        self.selection.selected()
    }

    pub fn sketch(&self) -> Option<&SketchAttachment> {
        self.sketch.as_ref()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn results(&self) -> &[Option<ResourceHandle>] {
        &self.results
    }

    pub fn last_job(&self) -> Option<&GenerationJob> {
        self.job.as_ref()
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn resolve_bytes(&self, handle: ResourceHandle) -> Option<&[u8]> {
        self.registry.resolve(handle)
    }

    pub fn handles_live(&self) -> usize {
        self.registry.live()
    }

    pub fn handles_created(&self) -> u64 {
        self.registry.created()
    }

    pub fn handles_revoked(&self) -> u64 {
        self.registry.revoked()
    }

    // ---- catalog ----------------------------------------------------------

    /// Starts a load attempt and marks the catalog as loading. The returned
    /// ticket must be handed back to `install_catalog`; issuing a newer
    /// ticket supersedes this one.
    pub fn begin_catalog_load(&mut self) -> Result<LoadTicket> {
        let ticket = self.loads.begin();
        self.catalog_state = CatalogState::Loading;
        self.events.emit(
            "catalog_load_started",
            map_object(json!({ "load": ticket.epoch() })),
        )?;
        Ok(ticket)
    }

    /// Fetches the style list and all thumbnails. Thumbnail fetches run
    /// concurrently; one failure fails the whole fetch and nothing of the
    /// partial result survives.
    pub async fn fetch_catalog(&self) -> Result<CatalogFetch> {
        let names = self
            .service
            .list_styles()
            .await
            .context("catalog load failed")?;
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        let fetches: Vec<_> = unique
            .iter()
            .map(|name| self.fetch_style_entry(name))
            .collect();
        let entries = join_all(fetches)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(CatalogFetch { entries })
    }

    async fn fetch_style_entry(&self, name: &str) -> Result<(String, Vec<u8>)> {
        let bytes = self
            .service
            .fetch_style_image(name)
            .await
            .with_context(|| format!("style image fetch failed for '{name}'"))?;
        Ok((name.to_string(), bytes))
    }

    /// Installs a fetch outcome. A stale ticket discards the outcome whatever
    /// it was; a failed fetch marks the catalog failed; a successful fetch
    /// replaces the catalog atomically, revokes the outgoing thumbnails, and
    /// rebinds the selection.
    pub fn install_catalog(
        &mut self,
        ticket: LoadTicket,
        outcome: Result<CatalogFetch>,
    ) -> Result<CatalogInstall> {
        if !self.loads.is_current(ticket) {
            self.events.emit(
                "catalog_load_superseded",
                map_object(json!({
                    "load": ticket.epoch(),
                    "fetched": outcome.as_ref().map(CatalogFetch::len).unwrap_or(0),
                })),
            )?;
            return Ok(CatalogInstall::Superseded);
        }

        let fetch = match outcome {
            Ok(fetch) => fetch,
            Err(err) => {
                self.catalog_state = CatalogState::Failed;
                self.catalog_error = Some(error_chain_text(&err, ERROR_EVENT_MAX_CHARS));
                self.events.emit(
                    "catalog_load_failed",
                    map_object(json!({
                        "load": ticket.epoch(),
                        "kind": workflow_kind(&err).unwrap_or("error"),
                        "error": self.catalog_error.clone(),
                    })),
                )?;
                return Err(err);
            }
        };

        let entries: Vec<(String, ResourceHandle)> = fetch
            .entries
            .into_iter()
            .map(|(name, bytes)| {
                let handle = self.registry.create(bytes, HandleOrigin::StyleThumbnail);
                (name, handle)
            })
            .collect();
        let installed = StyleCatalog::new(entries);
        let outgoing = std::mem::replace(&mut self.catalog, installed);
        for handle in outgoing.handles() {
            self.registry.revoke(handle);
        }
        self.catalog_state = CatalogState::Ready;
        self.catalog_error = None;

        let styles = self.catalog.len();
        self.events.emit(
            "catalog_loaded",
            map_object(json!({
                "load": ticket.epoch(),
                "styles": styles,
                "names": self.catalog.names().collect::<Vec<_>>(),
            })),
        )?;

        match self.selection.rebind(&self.catalog) {
            RebindOutcome::Kept { selected, command } => {
                self.emit_selection("rebind", Some(&selected))?;
                self.emit_gallery_command(command)?;
            }
            RebindOutcome::Reset { selected, command } => {
                self.emit_selection("default", selected.as_ref())?;
                self.emit_gallery_command(command)?;
            }
        }

        Ok(CatalogInstall::Installed { styles })
    }

    /// The sequential compose of begin/fetch/install for drivers that do not
    /// interleave loads.
    pub async fn reload_catalog(&mut self) -> Result<CatalogInstall> {
        let ticket = self.begin_catalog_load()?;
        let outcome = self.fetch_catalog().await;
        self.install_catalog(ticket, outcome)
    }

    // ---- selection --------------------------------------------------------

    pub fn gallery_moved(&mut self, position: usize) -> Result<Option<SelectedStyle>> {
        let selected = self.selection.gallery_moved(position, &self.catalog).cloned();
        self.emit_selection("gallery", selected.as_ref())?;
        Ok(selected)
    }

    pub fn select_style(
        &mut self,
        reference: &str,
    ) -> Result<(SelectedStyle, Option<GalleryCommand>)> {
        let Some(record) = self.resolve_style(reference) else {
            bail!("unknown style '{reference}'");
        };
        let command = self.selection.select_style(&record);
        let selected = SelectedStyle {
            name: record.name,
            index: record.index,
        };
        self.emit_selection("search", Some(&selected))?;
        self.emit_gallery_command(command)?;
        Ok((selected, command))
    }

    /// Resolution order for operator input: exact name, then display label,
    /// then numeric catalog index.
    fn resolve_style(&self, reference: &str) -> Option<StyleRecord> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(record) = self.catalog.by_name(trimmed) {
            return Some(record.clone());
        }
        if let Some(record) = self.catalog.by_label(trimmed) {
            return Some(record.clone());
        }
        trimmed
            .parse::<usize>()
            .ok()
            .and_then(|index| self.catalog.by_index(index))
            .cloned()
    }

    fn emit_selection(&self, origin: &str, selected: Option<&SelectedStyle>) -> Result<()> {
        self.events.emit(
            "style_selected",
            map_object(json!({
                "origin": origin,
                "style": selected.map(|style| style.name.clone()),
                "index": selected.map(|style| style.index),
                "position": self.selection.position(),
            })),
        )?;
        Ok(())
    }

    fn emit_gallery_command(&self, command: Option<GalleryCommand>) -> Result<()> {
        if let Some(GalleryCommand::ScrollTo(position)) = command {
            self.events.emit(
                "gallery_command",
                map_object(json!({
                    "command": "scroll_to",
                    "position": position,
                })),
            )?;
        }
        Ok(())
    }

    // ---- sketch -----------------------------------------------------------

    pub fn attach_sketch(&mut self, path: &Path) -> Result<ResourceHandle> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed reading sketch {}", path.display()))?;
        let size = bytes.len();
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("sketch.png")
            .to_string();
        let handle = self.registry.create(bytes, HandleOrigin::SketchPreview);
        let previous = self.sketch.replace(SketchAttachment {
            name: name.clone(),
            handle,
        });
        if let Some(previous) = previous {
            self.registry.revoke(previous.handle);
        }
        self.events.emit(
            "sketch_attached",
            map_object(json!({
                "name": name,
                "handle": handle,
                "bytes": size,
            })),
        )?;
        Ok(handle)
    }

    pub fn detach_sketch(&mut self) -> Result<bool> {
        let Some(previous) = self.sketch.take() else {
            return Ok(false);
        };
        self.registry.revoke(previous.handle);
        self.events.emit(
            "sketch_cleared",
            map_object(json!({ "name": previous.name })),
        )?;
        Ok(true)
    }

    // ---- prompt -----------------------------------------------------------

    pub fn set_prompt(&mut self, text: &str) -> Result<()> {
        self.prompt = text.trim().to_string();
        self.events.emit(
            "prompt_set",
            map_object(json!({ "prompt": self.prompt.clone() })),
        )?;
        Ok(())
    }

    /// Asks the service for a rewritten prompt based on the attached sketch.
    /// On success the prompt is replaced with the quote-stripped reply; on
    /// failure the prompt is left byte-for-byte untouched.
    pub async fn augment_prompt(&mut self) -> Result<String> {
        let Some(sketch) = self.sketch.clone() else {
            bail!(WorkflowError::NoSketchSelected);
        };
        let Some(bytes) = self.registry.resolve(sketch.handle).map(|bytes| bytes.to_vec()) else {
            bail!(WorkflowError::NoSketchSelected);
        };

        let outcome = self
            .service
            .augment_prompt(&sketch.name, &bytes, &self.prompt)
            .await;
        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) => {
                self.events.emit(
                    "prompt_augment_failed",
                    map_object(json!({
                        "kind": workflow_kind(&err).unwrap_or("error"),
                        "error": error_chain_text(&err, ERROR_EVENT_MAX_CHARS),
                    })),
                )?;
                return Err(err);
            }
        };

        let cleaned = strip_wrapping_quotes(&raw);
        let diff = prompt_diff(&self.prompt, &cleaned);
        self.prompt = cleaned.clone();
        self.events.emit(
            "prompt_augmented",
            map_object(json!({
                "prompt": cleaned.clone(),
                "diff": diff,
            })),
        )?;
        Ok(cleaned)
    }

    // ---- upload -----------------------------------------------------------

    /// Uploads a style image and, on success, reloads the catalog so the
    /// server-assigned entry shows up with its real thumbnail.
    pub async fn upload_style(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed reading style {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("style.png")
            .to_string();

        match self.service.upload_style(&file_name, bytes).await {
            Ok(()) => {
                self.events.emit(
                    "style_upload_succeeded",
                    map_object(json!({ "name": file_name })),
                )?;
            }
            Err(err) => {
                self.events.emit(
                    "style_upload_failed",
                    map_object(json!({
                        "name": file_name,
                        "kind": workflow_kind(&err).unwrap_or("error"),
                        "error": error_chain_text(&err, ERROR_EVENT_MAX_CHARS),
                    })),
                )?;
                return Err(err);
            }
        }

        self.reload_catalog()
            .await
            .context("catalog reload after upload failed")?;
        Ok(())
    }

    // ---- generation -------------------------------------------------------

    /// Runs the full slot batch. Slots are strictly sequential and fail-fast:
    /// the first failure stops the run, later slots stay untouched, earlier
    /// successes stay installed. A run already in flight refuses re-entry.
    pub async fn run_generation(&mut self) -> Result<RunOutcome> {
        if self.generating {
            self.events.emit(
                "generation_refused",
                map_object(json!({ "reason": "already_running" })),
            )?;
            return Ok(RunOutcome::AlreadyRunning);
        }
        let Some(sketch) = self.sketch.clone() else {
            bail!(WorkflowError::NoSketchSelected);
        };
        let Some(sketch_bytes) = self.registry.resolve(sketch.handle).map(|bytes| bytes.to_vec())
        else {
            bail!(WorkflowError::NoSketchSelected);
        };
        let Some(selected) = self.selection.selected().cloned() else {
            bail!(WorkflowError::NoStyleSelected);
        };

        let request = GenerateRequest {
            sketch_name: sketch.name,
            sketch: sketch_bytes,
            style_name: selected.name.clone(),
            prompt: self.prompt.clone(),
            width: self.config.artifact_width,
            height: self.config.artifact_height,
        };
        let mut job = GenerationJob::new(self.config.slot_count);
        self.total_runs += 1;
        self.events.emit(
            "generation_started",
            map_object(json!({
                "job_id": job.job_id(),
                "style": selected.name,
                "prompt": self.prompt.clone(),
                "slots": job.slot_count(),
            })),
        )?;

        self.generating = true;
        let driven = self.drive_slots(&mut job, &request).await;
        self.generating = false;
        driven?;

        let outcome = job
            .outcome()
            .context("generation run ended in a non-terminal state")?;
        self.total_artifacts += job.succeeded_handles().len() as u64;
        self.events.emit(
            "generation_finished",
            map_object(json!({
                "job_id": job.job_id(),
                "outcome": match &outcome {
                    RunOutcome::Completed { .. } => "completed",
                    RunOutcome::FailedAt { .. } => "failed",
                    RunOutcome::AlreadyRunning => "already_running",
                },
                "failed_slot": job.first_failure(),
                "succeeded": job.succeeded_handles().len(),
                "states": job.slots().iter().map(|state| state.as_str()).collect::<Vec<_>>(),
            })),
        )?;
        self.job = Some(job);
        Ok(outcome)
    }

    async fn drive_slots(
        &mut self,
        job: &mut GenerationJob,
        request: &GenerateRequest,
    ) -> Result<()> {
        for slot in 0..job.slot_count() {
            if !job.begin_slot(slot) {
                break;
            }
            self.events.emit(
                "slot_started",
                map_object(json!({
                    "job_id": job.job_id(),
                    "slot": slot,
                })),
            )?;
            match self.service.generate(request).await {
                Ok(bytes) => {
                    let handle = self.registry.create(bytes, HandleOrigin::ResultArtifact);
                    if let Some(entry) = self.results.get_mut(slot) {
                        if let Some(previous) = entry.replace(handle) {
                            self.registry.revoke(previous);
                        }
                    }
                    job.succeed_slot(slot, handle);
                    self.events.emit(
                        "slot_succeeded",
                        map_object(json!({
                            "job_id": job.job_id(),
                            "slot": slot,
                            "handle": handle,
                        })),
                    )?;
                }
                Err(err) => {
                    job.fail_slot(slot);
                    let failure = WorkflowError::GenerationStepFailed {
                        slot,
                        reason: error_chain_text(&err, ERROR_EVENT_MAX_CHARS),
                    };
                    self.events.emit(
                        "slot_failed",
                        map_object(json!({
                            "job_id": job.job_id(),
                            "slot": slot,
                            "kind": failure.kind(),
                            "error": failure.to_string(),
                        })),
                    )?;
                    break;
                }
            }
        }
        Ok(())
    }

    // ---- counter ----------------------------------------------------------

    /// Best-effort visit counter probe; failures are recorded but never
    /// propagate.
    pub async fn probe_counter(&self) -> Result<Option<u64>> {
        match self.service.visit_counter().await {
            Ok(count) => {
                self.events.emit(
                    "counter_probe",
                    map_object(json!({ "count": count })),
                )?;
                Ok(Some(count))
            }
            Err(err) => {
                self.events.emit(
                    "counter_probe",
                    map_object(json!({
                        "count": Value::Null,
                        "error": error_chain_text(&err, ERROR_EVENT_MAX_CHARS),
                    })),
                )?;
                Ok(None)
            }
        }
    }

    // ---- export / shutdown ------------------------------------------------

    /// Writes every filled result slot to `dir`, one file per artifact.
    pub fn export_artifacts(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut written = Vec::new();
        for (slot, entry) in self.results.iter().enumerate() {
            let Some(handle) = entry else {
                continue;
            };
            let Some(bytes) = self.registry.resolve(*handle) else {
                continue;
            };
            let ext = sniff_image_extension(bytes);
            let path = dir.join(format!(
                "artifact-{}-{}.{}",
                slot,
                short_id(&self.prompt, slot as u64),
                ext
            ));
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            written.push(path);
        }
        self.events.emit(
            "artifacts_exported",
            map_object(json!({
                "dir": dir.to_string_lossy().to_string(),
                "count": written.len(),
                "files": written
                    .iter()
                    .map(|path| path.to_string_lossy().to_string())
                    .collect::<Vec<_>>(),
            })),
        )?;
        Ok(written)
    }

    /// Releases every owned display resource, writes `summary.json`, and
    /// emits the closing event. Handles still live after the release pass
    /// are leaks; the summary names each one with its origin instead of
    /// papering over the imbalance.
    pub fn finish(&mut self) -> Result<SessionSummary> {
        for entry in self.results.iter_mut() {
            if let Some(handle) = entry.take() {
                self.registry.revoke(handle);
            }
        }
        if let Some(sketch) = self.sketch.take() {
            self.registry.revoke(sketch.handle);
        }
        let outgoing = std::mem::take(&mut self.catalog);
        for handle in outgoing.handles() {
            self.registry.revoke(handle);
        }
        self.catalog_state = CatalogState::NotLoaded;
        self.job = None;

        let leaked: Vec<LeakedHandle> = self
            .registry
            .live_handles()
            .into_iter()
            .map(|handle| LeakedHandle {
                token: handle.token(),
                origin: self
                    .registry
                    .origin(handle)
                    .map(|origin| origin.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            })
            .collect();

        let summary = SessionSummary {
            session_id: self.events.session_id().to_string(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            total_runs: self.total_runs,
            total_artifacts: self.total_artifacts,
            handles_created: self.registry.created(),
            handles_revoked: self.registry.revoked(),
            leaked,
        };
        write_summary(&self.summary_path, &summary, None)?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "total_runs": summary.total_runs,
                "total_artifacts": summary.total_artifacts,
                "handles_created": summary.handles_created,
                "handles_revoked": summary.handles_revoked,
                "handles_leaked": summary.leaked.len(),
            })),
        )?;
        Ok(summary)
    }
}

/// CLI flag wins, then `VEDUTA_SERVER`, then the local default.
pub fn resolve_server(cli_value: Option<&str>) -> String {
    if let Some(value) = cli_value.map(str::trim).filter(|value| !value.is_empty()) {
        return value.trim_end_matches('/').to_string();
    }
    non_empty_env("VEDUTA_SERVER")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string())
}

fn network_failure(operation: &str, err: reqwest::Error) -> anyhow::Error {
    let reason = err.to_string();
    anyhow::Error::new(err).context(WorkflowError::NetworkFailure {
        operation: operation.to_string(),
        reason,
    })
}

fn encode_solid_png(width: u32, height: u32, (r, g, b): (u8, u8, u8)) -> Result<Vec<u8>> {
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed encoding dryrun image")?;
    Ok(bytes)
}

fn color_from_text(text: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn sniff_image_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        _ => "png",
    }
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
