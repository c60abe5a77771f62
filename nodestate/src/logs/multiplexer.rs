//! Merges the logs of a workflow's pods into one time-ordered feed.

use super::entry::{sort_entries, LineSplitter, LogEntry};
use crate::cancellation::{CancellationToken, KeyedTaskGroup};
use crate::config::LogMultiplexerConfig;
use crate::errors::{NodeStateError, Result};
use crate::substrate::{
    is_expired, LabelSelector, PodApi, PodInfo, PodLogOptions, PodPhase, WatchEvent, WatchStream, WorkflowEvent,
    WorkflowWatcher,
};
use crate::utils::{Clock, SystemClock};
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Label carrying the owning workflow's name on every pod.
pub const WORKFLOW_LABEL: &str = "workflows.nodestate.io/workflow";

/// What to read and how to filter it.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Only this pod.
    pub pod_name: Option<String>,
    /// Only lines whose content matches this regular expression.
    pub grep: Option<String>,
    /// Extra label selector joined with the workflow selector.
    pub selector: Option<String>,
    /// Per-pod log request options.
    pub pod_log_options: PodLogOptions,
}

impl LogOptions {
    /// Creates options reading every pod once.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one pod.
    #[must_use]
    pub fn with_pod_name(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self
    }

    /// Keeps only matching lines.
    #[must_use]
    pub fn with_grep(mut self, pattern: impl Into<String>) -> Self {
        self.grep = Some(pattern.into());
        self
    }

    /// Adds a label selector.
    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Keeps streams open and follows new pods until the workflow ends.
    #[must_use]
    pub fn with_follow(mut self, follow: bool) -> Self {
        self.pod_log_options.follow = follow;
        self
    }

    /// Keeps the timestamp prefix in each line's content.
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.pod_log_options.timestamps = timestamps;
        self
    }

    /// Reads only the last `lines` lines of each pod.
    #[must_use]
    pub fn with_tail_lines(mut self, lines: i64) -> Self {
        self.pod_log_options.tail_lines = Some(lines);
        self
    }
}

/// Shared by every streamer of one run.
struct StreamContext {
    pods: Arc<dyn PodApi>,
    clock: Arc<dyn Clock>,
    namespace: String,
    request: PodLogOptions,
    keep_timestamps: bool,
    pod_name: Option<String>,
    grep: Option<Regex>,
    max_line_bytes: usize,
    sender: mpsc::Sender<LogEntry>,
}

impl StreamContext {
    fn wants(&self, pod: &PodInfo) -> bool {
        pod.phase != PodPhase::Pending && self.pod_name.as_ref().map_or(true, |name| *name == pod.name)
    }

    /// Sends one line; false once the run is over.
    async fn emit(&self, pod_name: &str, line: &str, token: &CancellationToken) -> bool {
        let entry = LogEntry::parse(pod_name, line, self.keep_timestamps, self.clock.now());
        if self.grep.as_ref().is_some_and(|re| !re.is_match(&entry.content)) {
            return true;
        }
        tokio::select! {
            sent = self.sender.send(entry) => sent.is_ok(),
            () = token.cancelled() => false,
        }
    }

    async fn stream_pod(&self, pod_name: &str, token: &CancellationToken) {
        let opened = tokio::select! {
            () = token.cancelled() => return,
            opened = self.pods.get_logs(&self.namespace, pod_name, &self.request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Failed to open pod log stream");
                return;
            }
        };

        let mut splitter = LineSplitter::new(self.max_line_bytes);
        let mut lines = 0usize;
        loop {
            let chunk = tokio::select! {
                () = token.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for line in splitter.push(&bytes) {
                        if !self.emit(pod_name, &line, token).await {
                            return;
                        }
                        lines += 1;
                    }
                }
                Some(Err(e)) => {
                    warn!(pod = %pod_name, error = %e, "Pod log stream failed");
                    break;
                }
                None => break,
            }
        }
        if let Some(line) = splitter.finish() {
            if self.emit(pod_name, &line, token).await {
                lines += 1;
            }
        }
        debug!(pod = %pod_name, lines = lines, "Pod log stream ended");
    }
}

/// Streams the logs of every pod of a workflow and hands them to a sink in
/// timestamp order.
///
/// Each pod gets at most one streamer. Lines collect in a bounded channel;
/// every drain interval, and once more at the end, the collected lines are
/// sorted by timestamp and forwarded. Lines are globally ordered within one
/// drain window; across windows ordering relies on pod host clocks.
///
/// Without `follow` the run ends once the listed pods' streams end. With
/// `follow` it also watches for new pods and ends when the workflow reaches
/// a terminal phase or is deleted, after the remaining streams end.
pub struct LogMultiplexer {
    pods: Arc<dyn PodApi>,
    workflows: Arc<dyn WorkflowWatcher>,
    config: LogMultiplexerConfig,
    clock: Arc<dyn Clock>,
}

impl LogMultiplexer {
    /// Creates a multiplexer.
    #[must_use]
    pub fn new(pods: Arc<dyn PodApi>, workflows: Arc<dyn WorkflowWatcher>, config: LogMultiplexerConfig) -> Self {
        Self {
            pods,
            workflows,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock used for lines without a timestamp.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Streams the logs of workflow `workflow` in `namespace` into `sink`.
    ///
    /// Returns when the logs are exhausted, the workflow ends (with follow),
    /// or `token` is cancelled. A sink error stops the run and is returned.
    pub async fn run<F>(
        &self,
        namespace: &str,
        workflow: &str,
        options: LogOptions,
        mut sink: F,
        token: Arc<CancellationToken>,
    ) -> Result<()>
    where
        F: FnMut(LogEntry) -> Result<()> + Send,
    {
        let mut selector = LabelSelector::everything().with_equals(WORKFLOW_LABEL, workflow);
        if let Some(extra) = options.selector.as_deref().filter(|s| !s.is_empty()) {
            selector = selector.and(&LabelSelector::parse(extra)?);
        }
        let grep = match options.grep.as_deref().filter(|g| !g.is_empty()) {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|e| NodeStateError::validation(format!("invalid grep pattern: {e}")))?,
            ),
            None => None,
        };
        let follow = options.pod_log_options.follow;

        let run_token = CancellationToken::child_of(&token);
        let group = KeyedTaskGroup::with_token(Arc::clone(&run_token));
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));

        // Subscribe before listing so a workflow finishing meanwhile is seen.
        let workflow_watch = if follow {
            match self.workflows.watch_phase(namespace, workflow).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(workflow = %workflow, error = %e, "Failed to watch workflow");
                    None
                }
            }
        } else {
            None
        };

        let listed = self.pods.list(namespace, &selector).await?;
        let mut request = options.pod_log_options.clone();
        request.timestamps = true;
        let context = Arc::new(StreamContext {
            pods: Arc::clone(&self.pods),
            clock: Arc::clone(&self.clock),
            namespace: namespace.to_string(),
            request,
            keep_timestamps: options.pod_log_options.timestamps,
            pod_name: options.pod_name.clone(),
            grep,
            max_line_bytes: self.config.max_line_bytes,
            sender,
        });

        let pod_count = listed.items.len();
        Self::stream_listed(&group, &context, listed.items);
        info!(
            namespace = %namespace,
            workflow = %workflow,
            pods = pod_count,
            follow = follow,
            "Streaming workflow logs"
        );

        let group_ref = &group;
        let discovery_token = Arc::clone(&run_token);
        let since = listed.resource_version;
        let discovery = async move {
            if follow {
                self.discover(namespace, workflow, &selector, since, workflow_watch, group_ref, &context, &discovery_token)
                    .await;
            }
            group_ref.join_all().await;
            // The last sender goes with the context; the drainer then sees the
            // channel close.
            drop(context);
        };
        let drain = self.drain(receiver, &mut sink, &run_token);
        let ((), drained) = tokio::join!(discovery, drain);
        drained
    }

    fn stream_listed(group: &KeyedTaskGroup, context: &Arc<StreamContext>, mut pods: Vec<PodInfo>) {
        pods.sort_by_key(|p| p.start_time);
        for pod in &pods {
            Self::ensure_streaming(group, context, pod);
        }
    }

    fn ensure_streaming(group: &KeyedTaskGroup, context: &Arc<StreamContext>, pod: &PodInfo) {
        if !context.wants(pod) {
            return;
        }
        let streamer = Arc::clone(context);
        let pod_name = pod.name.clone();
        if group.spawn_unique(&pod.name, move |token| async move {
            streamer.stream_pod(&pod_name, &token).await;
        }) {
            debug!(pod = %pod.name, phase = %pod.phase, "Started pod log streamer");
        }
    }

    /// Follows pod and workflow changes until the workflow ends.
    ///
    /// The pod watch resumes from the last version seen. When that version
    /// has expired the pods are listed again, new ones start streaming, and
    /// the watch resumes from the list.
    #[allow(clippy::too_many_arguments)]
    async fn discover(
        &self,
        namespace: &str,
        workflow: &str,
        selector: &LabelSelector,
        mut since: String,
        mut workflow_watch: Option<BoxStream<'static, Result<WorkflowEvent>>>,
        group: &KeyedTaskGroup,
        context: &Arc<StreamContext>,
        token: &CancellationToken,
    ) {
        let mut pod_watch: Option<WatchStream<PodInfo>> = None;
        let mut rewatch = false;
        let mut relist = false;
        loop {
            if rewatch {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(self.config.rewatch_delay()) => {}
                }
                rewatch = false;
            }
            if relist {
                match self.pods.list(namespace, selector).await {
                    Ok(listed) => {
                        debug!(workflow = %workflow, pods = listed.items.len(), "Relisted pods");
                        since = listed.resource_version;
                        Self::stream_listed(group, context, listed.items);
                        relist = false;
                    }
                    Err(e) => warn!(workflow = %workflow, error = %e, "Failed to relist pods"),
                }
            }
            if pod_watch.is_none() && !relist {
                match self.pods.watch(namespace, selector, Some(&since)).await {
                    Ok(stream) => pod_watch = Some(stream),
                    Err(e) if is_expired(&e) => {
                        debug!(workflow = %workflow, since = %since, "Pod watch version expired, relisting");
                        relist = true;
                        continue;
                    }
                    Err(e) => warn!(workflow = %workflow, error = %e, "Failed to watch pods"),
                }
            }
            if workflow_watch.is_none() {
                match self.workflows.watch_phase(namespace, workflow).await {
                    Ok(stream) => workflow_watch = Some(stream),
                    Err(e) => warn!(workflow = %workflow, error = %e, "Failed to watch workflow"),
                }
            }
            let retry = pod_watch.is_none() || workflow_watch.is_none();

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(self.config.rewatch_delay()), if retry => {}
                event = next_event(&mut pod_watch) => match event {
                    Some(Ok(event)) => {
                        if let Some(version) = &event.object().resource_version {
                            since.clone_from(version);
                        }
                        if let WatchEvent::Added(pod) | WatchEvent::Modified(pod) = &event {
                            Self::ensure_streaming(group, context, pod);
                        }
                    }
                    Some(Err(e)) if is_expired(&e) => {
                        debug!(workflow = %workflow, since = %since, "Pod watch version expired, relisting");
                        pod_watch = None;
                        relist = true;
                    }
                    Some(Err(e)) => {
                        warn!(workflow = %workflow, error = %e, "Pod watch failed, re-watching");
                        pod_watch = None;
                        rewatch = true;
                    }
                    None => {
                        debug!(workflow = %workflow, since = %since, "Pod watch closed, re-watching");
                        pod_watch = None;
                        rewatch = true;
                    }
                },
                event = next_event(&mut workflow_watch) => match event {
                    Some(Ok(WorkflowEvent::Phase(phase))) if phase.is_terminal() => {
                        info!(workflow = %workflow, phase = %phase, "Workflow finished, no longer following pods");
                        return;
                    }
                    Some(Ok(WorkflowEvent::Deleted)) => {
                        info!(workflow = %workflow, "Workflow deleted, no longer following pods");
                        return;
                    }
                    Some(Ok(WorkflowEvent::Phase(_))) => {}
                    Some(Err(e)) => {
                        warn!(workflow = %workflow, error = %e, "Workflow watch failed, re-watching");
                        workflow_watch = None;
                        rewatch = true;
                    }
                    None => {
                        debug!(workflow = %workflow, "Workflow watch closed, re-watching");
                        workflow_watch = None;
                        rewatch = true;
                    }
                },
            }
        }
    }

    async fn drain<F>(&self, mut receiver: mpsc::Receiver<LogEntry>, sink: &mut F, token: &CancellationToken) -> Result<()>
    where
        F: FnMut(LogEntry) -> Result<()> + Send,
    {
        let mut buffer = Vec::new();
        let mut ticker = tokio::time::interval(self.config.drain_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                entry = receiver.recv() => match entry {
                    Some(entry) => buffer.push(entry),
                    None => return flush(&mut buffer, sink, token),
                },
                _ = ticker.tick() => flush(&mut buffer, sink, token)?,
                () = token.cancelled() => {
                    while let Ok(entry) = receiver.try_recv() {
                        buffer.push(entry);
                    }
                    return flush(&mut buffer, sink, token);
                }
            }
        }
    }
}

fn flush<F>(buffer: &mut Vec<LogEntry>, sink: &mut F, token: &CancellationToken) -> Result<()>
where
    F: FnMut(LogEntry) -> Result<()>,
{
    sort_entries(buffer);
    for entry in buffer.drain(..) {
        if let Err(e) = sink(entry) {
            token.cancel("log sink failed");
            return Err(e.context("log sink"));
        }
    }
    Ok(())
}

async fn next_event<T>(stream: &mut Option<BoxStream<'static, Result<T>>>) -> Option<Result<T>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for LogMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMultiplexer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
