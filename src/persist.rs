/*
FaF Scope is a live packet capture and network probe toolkit
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! bincode + zlib files

/// Writes next to `absolute_path` first and renames over it, so a crash never leaves half a file
pub fn write_to_file_bincode<T>(data: &T, absolute_path: &std::path::Path) -> crate::Result<()>
where
   T: serde::Serialize,
{
   use std::io::Write;

   let serialized_and_compressed_bytes = serialize_then_compress(data)?;
   if let Some(parent) = absolute_path.parent() {
      std::fs::create_dir_all(parent)?;
   }

   let staging_path = absolute_path.with_extension("tmp");
   let f = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(&staging_path)?;
   let mut writer = std::io::BufWriter::new(f);
   writer.write_all(serialized_and_compressed_bytes.as_slice())?;
   writer.flush()?;
   drop(writer);

   std::fs::rename(&staging_path, absolute_path)?;
   Ok(())
}

/// `Ok(None)` when there is no file yet, `Error::Persistence` when the file cannot be decoded
pub fn read_from_file_bincode<T>(absolute_path: &std::path::Path) -> crate::Result<Option<T>>
where
   T: serde::de::DeserializeOwned,
{
   use std::io::Read;

   let mut f = match std::fs::File::open(absolute_path) {
      Ok(f) => f,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(err) => return Err(err.into()),
   };
   let file_len = f.metadata()?.len();
   let mut bytes = Vec::with_capacity(file_len as usize + 1);
   f.read_to_end(&mut bytes)?;

   decompress_then_deserialize(bytes.as_slice()).map(Some)
}

fn serialize_then_compress<T>(serializable: &T) -> crate::Result<Vec<u8>>
where
   T: serde::Serialize,
{
   let bincode_bytes = bincode::serialize::<T>(serializable).map_err(|err| crate::Error::Persistence(err.to_string()))?;
   Ok(compress_zlib(&bincode_bytes)?)
}

fn decompress_then_deserialize<T>(deserializable: &[u8]) -> crate::Result<T>
where
   T: serde::de::DeserializeOwned,
{
   let mut decompressed_bytes = Vec::<u8>::new();
   decompress_zlib(deserializable, &mut decompressed_bytes).map_err(|err| crate::Error::Persistence(err.to_string()))?;
   bincode::deserialize::<T>(&decompressed_bytes).map_err(|err| crate::Error::Persistence(err.to_string()))
}

fn decompress_zlib(bytes: &[u8], buf_to_fill: &mut Vec<u8>) -> std::io::Result<usize> {
   use std::io::Read;

   let mut decompressor = flate2::read::ZlibDecoder::new(bytes);
   decompressor.read_to_end(buf_to_fill)
}

fn compress_zlib(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
   use std::io::Write;

   let mut compressor = flate2::write::ZlibEncoder::new(Vec::with_capacity(bytes.len()), flate2::Compression::fast());
   compressor.write_all(bytes)?;
   compressor.finish()
}
