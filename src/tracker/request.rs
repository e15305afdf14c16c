use url::Url;

/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// SHA1 hash of the info dictionary
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port reported as ours
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Number of bytes left to download
    pub left: u64,
    /// None for a regular re-announce
    pub event: Option<TrackerEvent>,
}

impl AnnounceRequest {
    /// Announce URL for `tracker`. Binary fields are percent-encoded byte by
    /// byte, so the query is assembled by hand rather than through
    /// `Url::query_pairs_mut`, which would escape the `%` again.
    pub fn to_url(&self, tracker: &Url) -> String {
        let mut url = tracker.as_str().to_string();
        url.push(if tracker.query().is_some() { '&' } else { '?' });

        url.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoded_hash(&self.info_hash),
            urlencoded_hash(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        ));

        if let Some(event) = self.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }

        url
    }
}

/// URL-encode a hash for tracker requests
fn urlencoded_hash(hash: &[u8; 20]) -> String {
    hash.iter().map(|b| format!("%{:02X}", b)).collect()
}
