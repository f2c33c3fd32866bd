use chrono::Datelike;

use crate::error::TransferError;

/// Strip the decorations users tend to type into a destination field:
/// a trailing `/` and a leading `./`.
pub fn normalize_destination(destination: &str) -> String {
    let trimmed = destination.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    if trimmed == "/" {
        return trimmed.to_string();
    }
    trimmed.trim_end_matches('/').to_string()
}

/// Join a destination directory and a file name.
/// An empty or `.` destination means the login directory.
pub fn remote_path(destination: &str, file_name: &str) -> String {
    let destination = normalize_destination(destination);
    match destination.as_str() {
        "" | "." => file_name.to_string(),
        "/" => format!("/{}", file_name),
        dir => format!("{}/{}", dir, file_name),
    }
}

/// Hierarchical remote path: {destination}/{year}/{month}/{day}/{file_name}
pub fn dated_remote_path<D: Datelike>(destination: &str, date: &D, file_name: &str) -> String {
    let dated = format!(
        "{:04}/{:02}/{:02}/{}",
        date.year(),
        date.month(),
        date.day(),
        file_name
    );
    remote_path(destination, &dated)
}

/// Break a remote file path into the directory segments to walk (in order)
/// and the final file name. An absolute path starts with a `/` segment.
pub fn split_remote_path(path: &str) -> Result<(Vec<&str>, &str), TransferError> {
    let mut segments = Vec::new();
    if path.starts_with('/') {
        segments.push("/");
    }
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(TransferError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }

    match segments.pop() {
        Some(file) if file != "/" && !path.ends_with('/') => Ok((segments, file)),
        _ => Err(TransferError::InvalidPath(path.to_string())),
    }
}
