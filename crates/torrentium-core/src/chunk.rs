//! File chunking, identifiers, and reassembly

use crate::{error::Result, types::*, Error};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// BLAKE3 digest of one chunk
pub fn chunk_digest(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Combine chunk digests, in index order, into the file's identifier
pub fn combine_digests<'a>(digests: impl IntoIterator<Item = &'a Digest>) -> ContentId {
    let mut hasher = blake3::Hasher::new();
    for digest in digests {
        hasher.update(digest);
    }
    ContentId::from_bytes(*hasher.finalize().as_bytes())
}

/// Chunk a file and compute its record.
///
/// Chunk data is not kept; seeders re-read chunks from `path` on demand.
pub fn chunk_file(path: &Path, chunk_size: usize) -> Result<FileRecord> {
    if chunk_size == 0 {
        return Err(Error::InvalidData("chunk size must be non-zero".to_string()));
    }

    let file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut reader = std::io::BufReader::new(file);
    let mut chunks = Vec::new();
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let bytes_read = read_full(&mut reader, &mut buffer)?;
        if bytes_read == 0 {
            break;
        }

        chunks.push(ChunkDescriptor {
            index: chunks.len() as u32,
            length: bytes_read as u32,
            digest: chunk_digest(&buffer[..bytes_read]),
        });
        total += bytes_read as u64;

        if bytes_read < chunk_size {
            break;
        }
    }

    if total != file_size {
        return Err(Error::InvalidData(format!(
            "{} changed while chunking ({} bytes read, {} expected)",
            path.display(),
            total,
            file_size
        )));
    }

    let location = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    Ok(FileRecord {
        id: combine_digests(chunks.iter().map(|c| &c.digest)),
        name,
        size: file_size,
        chunks,
        location: Location::Local(location),
        created_at: now_unix_secs(),
    })
}

/// Fill `buf` as far as the reader allows; short only at end of file
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one chunk of a locally held file
pub fn read_chunk(path: &Path, record: &FileRecord, index: u32) -> Result<Vec<u8>> {
    let descriptor = record
        .chunks
        .get(index as usize)
        .ok_or_else(|| Error::NotFound(format!("chunk {} of {}", index, record.id.short())))?;
    let offset = record.chunk_offset(index).unwrap_or_default();

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut data = vec![0u8; descriptor.length as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Verify a single chunk against its descriptor
pub fn verify_chunk(data: &[u8], descriptor: &ChunkDescriptor) -> Result<()> {
    if data.len() != descriptor.length as usize {
        return Err(Error::Corruption {
            index: descriptor.index,
            expected: format!("{} bytes", descriptor.length),
            actual: format!("{} bytes", data.len()),
        });
    }

    let computed = chunk_digest(data);
    if computed != descriptor.digest {
        return Err(Error::Corruption {
            index: descriptor.index,
            expected: hex::encode(descriptor.digest),
            actual: hex::encode(computed),
        });
    }

    Ok(())
}

/// Reassemble verified chunks into a file, in index order.
///
/// The identifier is recomputed from the written data and must match the
/// record; on mismatch the output file is removed.
pub fn reassemble_file(chunks: &[bytes::Bytes], record: &FileRecord, output_path: &Path) -> Result<()> {
    if chunks.len() != record.chunks.len() {
        return Err(Error::InvalidData(format!(
            "Expected {} chunks, got {}",
            record.chunks.len(),
            chunks.len()
        )));
    }

    let mut digests = Vec::with_capacity(chunks.len());
    for (data, descriptor) in chunks.iter().zip(&record.chunks) {
        verify_chunk(data, descriptor)?;
        digests.push(chunk_digest(data));
    }

    let recomputed = combine_digests(digests.iter());
    if recomputed != record.id {
        return Err(Error::InvalidData(format!(
            "reassembled content is {}, expected {}",
            recomputed.short(),
            record.id.short()
        )));
    }

    let mut file = std::fs::File::create(output_path)?;
    for chunk in chunks {
        file.write_all(chunk)?;
    }
    file.sync_all()?;

    Ok(())
}
