//! Log file round trip: an opaque binary format and a hierarchical columnar
//! format.
//!
//! The binary format is a magic/version header followed by a bincode
//! payload of the full [`LogData`]. The columnar format lays the same data
//! out hierarchically: root attributes `VERSION` and `START_TIME`, the
//! `Global.Time` int64 dataset with its float `unit` attribute, the ordered
//! `constants` group of null-padded byte strings, and the `variables` group
//! with one `value` dataset per field, integer fields first, preserving
//! creation order.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::GLOBAL_TIME;
use crate::error::{EngineError, Result};
use crate::telemetry::LogData;

/// Magic bytes of the binary log format.
pub const BINARY_MAGIC: [u8; 4] = *b"SEL1";
/// Magic bytes of the columnar log format.
pub const COLUMNAR_MAGIC: [u8; 4] = *b"SEH5";
/// Container format version.
pub const CONTAINER_VERSION: u32 = 1;

/// Log file format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Opaque recorder round trip.
    Binary,
    /// Hierarchical columnar layout.
    Hdf5,
}

impl std::str::FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(Self::Binary),
            "hdf5" => Ok(Self::Hdf5),
            other => Err(EngineError::bad_input(format!(
                "format '{other}' not recognized, must be either 'binary' or 'hdf5'"
            ))),
        }
    }
}

fn io_err(context: &str, err: &std::io::Error) -> EngineError {
    EngineError::bad_input(format!("{context}: {err}"))
}

/// Write a log to disk in the requested format.
///
/// # Errors
///
/// Fails with `BadInput` on I/O or encoding errors, or when the log is
/// empty.
pub fn write_log(path: &Path, log: &LogData, format: LogFormat) -> Result<()> {
    if log.timestamps.is_empty() {
        return Err(EngineError::bad_input(
            "no data available, run a simulation before writing a log",
        ));
    }
    let file = File::create(path).map_err(|e| io_err("cannot create log file", &e))?;
    let mut writer = BufWriter::new(file);
    match format {
        LogFormat::Binary => write_binary(&mut writer, log),
        LogFormat::Hdf5 => write_columnar(&mut writer, log),
    }
}

/// Read a log from disk in the requested format.
///
/// # Errors
///
/// Fails with `BadInput` on I/O or decoding errors.
pub fn read_log(path: &Path, format: LogFormat) -> Result<LogData> {
    let file = File::open(path).map_err(|e| io_err("cannot open log file", &e))?;
    let mut reader = BufReader::new(file);
    match format {
        LogFormat::Binary => read_binary(&mut reader),
        LogFormat::Hdf5 => read_columnar(&mut reader),
    }
}

fn write_binary(writer: &mut impl Write, log: &LogData) -> Result<()> {
    writer
        .write_all(&BINARY_MAGIC)
        .and_then(|()| writer.write_all(&CONTAINER_VERSION.to_le_bytes()))
        .and_then(|()| writer.write_all(&0u32.to_le_bytes()))
        .map_err(|e| io_err("cannot write log header", &e))?;
    bincode::serialize_into(writer, log)
        .map_err(|e| EngineError::bad_input(format!("cannot encode log payload: {e}")))
}

fn read_binary(reader: &mut impl Read) -> Result<LogData> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| io_err("cannot read log header", &e))?;
    if magic != BINARY_MAGIC {
        return Err(EngineError::bad_input("not a binary log file"));
    }
    let version = read_u32(reader)?;
    if version != CONTAINER_VERSION {
        return Err(EngineError::bad_input(format!(
            "unsupported binary log version {version}"
        )));
    }
    let _flags = read_u32(reader)?;
    bincode::deserialize_from(reader)
        .map_err(|e| EngineError::bad_input(format!("cannot decode log payload: {e}")))
}

// -- columnar layout --------------------------------------------------------

fn write_bytes(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    let len = u64::try_from(bytes.len())
        .map_err(|_| EngineError::bad_input("log section too large"))?;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|()| writer.write_all(bytes))
        .map_err(|e| io_err("cannot write log section", &e))
}

fn read_bytes(reader: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u64(reader)?;
    let len = usize::try_from(len)
        .map_err(|_| EngineError::bad_input("corrupted log section length"))?;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| io_err("cannot read log section", &e))?;
    Ok(buf)
}

fn write_str(writer: &mut impl Write, s: &str) -> Result<()> {
    write_bytes(writer, s.as_bytes())
}

fn read_str(reader: &mut impl Read) -> Result<String> {
    let bytes = read_bytes(reader)?;
    String::from_utf8(bytes).map_err(|_| EngineError::bad_input("corrupted log string"))
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| io_err("cannot read log word", &e))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| io_err("cannot read log word", &e))?;
    Ok(u64::from_le_bytes(buf))
}

fn write_i64_column(writer: &mut impl Write, column: &[i64]) -> Result<()> {
    let mut bytes = Vec::with_capacity(8 * column.len());
    for value in column {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    write_bytes(writer, &bytes)
}

fn read_i64_column(reader: &mut impl Read) -> Result<Vec<i64>> {
    let bytes = read_bytes(reader)?;
    if bytes.len() % 8 != 0 {
        return Err(EngineError::bad_input("corrupted int64 dataset"));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn write_f64_column(writer: &mut impl Write, column: &[f64]) -> Result<()> {
    let mut bytes = Vec::with_capacity(8 * column.len());
    for value in column {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    write_bytes(writer, &bytes)
}

fn read_f64_column(reader: &mut impl Read) -> Result<Vec<f64>> {
    let bytes = read_bytes(reader)?;
    if bytes.len() % 8 != 0 {
        return Err(EngineError::bad_input("corrupted float64 dataset"));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn write_columnar(writer: &mut impl Write, log: &LogData) -> Result<()> {
    writer
        .write_all(&COLUMNAR_MAGIC)
        .and_then(|()| writer.write_all(&CONTAINER_VERSION.to_le_bytes()))
        .map_err(|e| io_err("cannot write log header", &e))?;

    // Root attributes.
    writer
        .write_all(&log.version.to_le_bytes())
        .map_err(|e| io_err("cannot write VERSION attribute", &e))?;
    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(0));
    writer
        .write_all(&start_time.to_le_bytes())
        .map_err(|e| io_err("cannot write START_TIME attribute", &e))?;

    // Global time dataset with its unit attribute.
    write_i64_column(writer, &log.timestamps)?;
    writer
        .write_all(&log.time_unit.to_le_bytes())
        .map_err(|e| io_err("cannot write time unit attribute", &e))?;

    // Constants group, order preserved, values stored as exact-length byte
    // strings.
    let n_constants = u32::try_from(log.constants.len())
        .map_err(|_| EngineError::bad_input("too many log constants"))?;
    writer
        .write_all(&n_constants.to_le_bytes())
        .map_err(|e| io_err("cannot write constants group", &e))?;
    for (key, value) in &log.constants {
        write_str(writer, key)?;
        write_str(writer, value)?;
    }

    // Variables group: integer datasets first, then floats, both in
    // creation order. Field 0 is the global time and is not repeated.
    let n_int = u32::try_from(log.int_data.len())
        .map_err(|_| EngineError::bad_input("too many integer fields"))?;
    let n_float = u32::try_from(log.float_data.len())
        .map_err(|_| EngineError::bad_input("too many float fields"))?;
    writer
        .write_all(&n_int.to_le_bytes())
        .and_then(|()| writer.write_all(&n_float.to_le_bytes()))
        .map_err(|e| io_err("cannot write variables group", &e))?;
    for (k, column) in log.int_data.iter().enumerate() {
        write_str(writer, &log.fieldnames[1 + k])?;
        write_i64_column(writer, column)?;
    }
    for (k, column) in log.float_data.iter().enumerate() {
        write_str(writer, &log.fieldnames[1 + log.int_data.len() + k])?;
        write_f64_column(writer, column)?;
    }
    Ok(())
}

fn read_columnar(reader: &mut impl Read) -> Result<LogData> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| io_err("cannot read log header", &e))?;
    if magic != COLUMNAR_MAGIC {
        return Err(EngineError::bad_input("not a columnar log file"));
    }
    let container_version = read_u32(reader)?;
    if container_version != CONTAINER_VERSION {
        return Err(EngineError::bad_input(format!(
            "unsupported columnar log version {container_version}"
        )));
    }

    let mut word = [0u8; 4];
    reader
        .read_exact(&mut word)
        .map_err(|e| io_err("cannot read VERSION attribute", &e))?;
    let version = i32::from_le_bytes(word);
    let mut long = [0u8; 8];
    reader
        .read_exact(&mut long)
        .map_err(|e| io_err("cannot read START_TIME attribute", &e))?;
    let _start_time = i64::from_le_bytes(long);

    let timestamps = read_i64_column(reader)?;
    reader
        .read_exact(&mut long)
        .map_err(|e| io_err("cannot read time unit attribute", &e))?;
    let time_unit = f64::from_le_bytes(long);

    let n_constants = read_u32(reader)?;
    let mut constants = Vec::with_capacity(n_constants as usize);
    for _ in 0..n_constants {
        let key = read_str(reader)?;
        let value_bytes = read_bytes(reader)?;
        let value = String::from_utf8_lossy(&value_bytes).into_owned();
        constants.push((key, value));
    }

    let n_int = read_u32(reader)? as usize;
    let n_float = read_u32(reader)? as usize;
    let mut fieldnames = Vec::with_capacity(1 + n_int + n_float);
    fieldnames.push(GLOBAL_TIME.to_string());
    let mut int_data = Vec::with_capacity(n_int);
    for _ in 0..n_int {
        fieldnames.push(read_str(reader)?);
        int_data.push(read_i64_column(reader)?);
    }
    let mut float_data = Vec::with_capacity(n_float);
    for _ in 0..n_float {
        fieldnames.push(read_str(reader)?);
        float_data.push(read_f64_column(reader)?);
    }

    Ok(LogData {
        version,
        time_unit,
        timestamps,
        int_data,
        float_data,
        fieldnames,
        constants,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::telemetry::LOG_VERSION;

    fn sample_log() -> LogData {
        LogData {
            version: LOG_VERSION,
            time_unit: 1e-10,
            timestamps: vec![0, 10_000, 20_000],
            int_data: vec![vec![0, 1, 2]],
            float_data: vec![vec![0.0, 0.5, 1.0], vec![-1.0, -0.5, 0.25]],
            fieldnames: vec![
                GLOBAL_TIME.to_string(),
                "iteration".to_string(),
                "robot.position_pivot".to_string(),
                "robot.velocity_pivot".to_string(),
            ],
            constants: vec![
                ("robot.urdf_file".to_string(), "<robot/>".to_string()),
                ("options".to_string(), "{}".to_string()),
            ],
        }
    }

    #[test]
    fn test_binary_roundtrip() {
        let dir = std::env::temp_dir().join("sim_engine_log_binary_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.bin");
        let log = sample_log();
        write_log(&path, &log, LogFormat::Binary).unwrap();
        let back = read_log(&path, LogFormat::Binary).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn test_columnar_roundtrip() {
        let dir = std::env::temp_dir().join("sim_engine_log_columnar_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.h5");
        let log = sample_log();
        write_log(&path, &log, LogFormat::Hdf5).unwrap();
        let back = read_log(&path, LogFormat::Hdf5).unwrap();
        assert_eq!(back, log);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("binary".parse::<LogFormat>().unwrap(), LogFormat::Binary);
        assert_eq!("hdf5".parse::<LogFormat>().unwrap(), LogFormat::Hdf5);
        assert!("csv".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_empty_log_rejected() {
        let dir = std::env::temp_dir().join("sim_engine_log_empty_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.bin");
        let mut log = sample_log();
        log.timestamps.clear();
        assert!(write_log(&path, &log, LogFormat::Binary).is_err());
    }
}
