use std::sync::atomic::{AtomicU64, Ordering};

use reef_vm::UploadedFile;

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Encodes form fields and uploaded files as `multipart/form-data`.
/// Returns the body bytes and the `content-type` header value carrying
/// the boundary.
pub fn encode_as_multipart(
    fields: &[(String, String)],
    files: &[UploadedFile],
) -> (Vec<u8>, String) {
    let boundary = format!(
        "----reefFormBoundary{:08x}{:08x}",
        std::process::id(),
        BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let content_type = format!("multipart/form-data; boundary={boundary}");

    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    for file in files {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                file.key, file.name
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.mime).as_bytes());
        body.extend_from_slice(&file.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    (body, content_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_and_files_share_one_boundary() {
        let fields = vec![("title".to_string(), "hello".to_string())];
        let files = vec![UploadedFile {
            key: "upload".to_string(),
            name: "a.txt".to_string(),
            mime: "text/plain".to_string(),
            data: b"contents".to_vec(),
        }];
        let (body, content_type) = encode_as_multipart(&fields, &files);
        let boundary = content_type.split("boundary=").nth(1).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.matches(boundary).count(), 3);
        assert!(text.contains("name=\"title\""));
        assert!(text.contains("filename=\"a.txt\""));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }
}
