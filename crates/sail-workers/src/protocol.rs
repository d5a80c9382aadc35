//! The line-delimited JSON protocol between the pool and worker hosts.
//!
//! The pool writes one [`JobRequest`] per line on the worker's stdin; the
//! worker answers with a stream of [`JobEvent`] lines and finishes the job
//! with an `Exit` event carrying the command's exit code and the worker's
//! resident set size.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub worker_name: String,
    pub command: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobEvent {
    Stdout { line: String },
    Stderr { line: String },
    Exit { code: i32, rss_bytes: u64 },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let request = JobRequest {
            worker_name: "tsc".into(),
            command: "tsc --build".into(),
            cwd: "/repo/packages/web".into(),
        };
        let line = serde_json::to_string(&request).unwrap();
        assert_eq!(serde_json::from_str::<JobRequest>(&line).unwrap(), request);

        let event = JobEvent::Exit {
            code: 0,
            rss_bytes: 1024,
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains(r#""kind":"exit""#), "{line}");
        assert_eq!(serde_json::from_str::<JobEvent>(&line).unwrap(), event);
    }
}
