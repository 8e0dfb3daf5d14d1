use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::entities::LayoutDocument;

pub fn sanitize_doc_name(doc_name: &str) -> String {
    doc_name
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                Some(c)
            } else if c.is_whitespace() {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
}

/// Writes the pretty-printed layout JSON to `output_dir/file_name`, creating the directory.
pub fn save_layout_document(
    doc: &LayoutDocument,
    output_dir: &Path,
    file_name: &str,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("can't create output dir {}", output_dir.display()))?;
    let file_out = output_dir.join(file_name);
    let file = File::create(&file_out)
        .with_context(|| format!("can't create {}", file_out.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, doc)?;
    writer.flush()?;
    Ok(file_out)
}
