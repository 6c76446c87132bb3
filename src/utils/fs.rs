use std::path::Path;

/// Strip any directory components from a caller-supplied filename.
///
/// Inbound filenames cross a trust boundary; only the final path component
/// is ever used when naming artifacts under the managed temp directory.
pub fn sanitize_filename(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
}
