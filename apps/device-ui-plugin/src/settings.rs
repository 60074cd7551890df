//! Conversion between the JSON-safe settings document persisted by the host
//! and the typed document carried by outbound UI commands.
//!
//! The wire form keeps every field as a scalar or string: the two series are
//! JSON text, the two corner tables are CSV text with the row index in the
//! first column. The typed form parses those into ordered numeric maps and
//! row-indexed tables. Conversion is pure; nothing here touches the bus or the
//! configuration store.

use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Number;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_WIDTH: i64 = 400;
pub const DEFAULT_HEIGHT: i64 = 500;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed settings field `{field}`: {reason}")]
    MalformedSettings { field: &'static str, reason: String },
}

impl CodecError {
    fn malformed(field: &'static str, reason: impl ToString) -> Self {
        CodecError::MalformedSettings {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Settings as persisted by the host configuration store.
///
/// Absent fields stay absent through every conversion; a JSON `null` reads as
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_alphas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_corners: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_corners: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

impl WireSettings {
    /// Values a plugin starts with before anything has been persisted.
    pub fn with_form_defaults() -> Self {
        Self {
            video_config: Some(String::new()),
            surface_alphas: Some(String::new()),
            canvas_corners: Some(String::new()),
            frame_corners: Some(String::new()),
            x: None,
            y: None,
            width: Some(DEFAULT_WIDTH),
            height: Some(DEFAULT_HEIGHT),
        }
    }

    pub fn geometry(&self) -> WindowGeometry {
        WindowGeometry {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    /// True when every field set in `update` already holds the same value
    /// here, i.e. applying `update` would change nothing.
    pub fn contains(&self, update: &WireSettings) -> bool {
        fn same<T: PartialEq>(current: &Option<T>, update: &Option<T>) -> bool {
            update.is_none() || current == update
        }
        same(&self.video_config, &update.video_config)
            && same(&self.surface_alphas, &update.surface_alphas)
            && same(&self.canvas_corners, &update.canvas_corners)
            && same(&self.frame_corners, &update.frame_corners)
            && same(&self.x, &update.x)
            && same(&self.y, &update.y)
            && same(&self.width, &update.width)
            && same(&self.height, &update.height)
    }

    /// Copies every field set in `update` over this document.
    pub fn overlay(&mut self, update: &WireSettings) {
        fn set<T: Clone>(current: &mut Option<T>, update: &Option<T>) {
            if let Some(value) = update {
                *current = Some(value.clone());
            }
        }
        set(&mut self.video_config, &update.video_config);
        set(&mut self.surface_alphas, &update.surface_alphas);
        set(&mut self.canvas_corners, &update.canvas_corners);
        set(&mut self.frame_corners, &update.frame_corners);
        set(&mut self.x, &update.x);
        set(&mut self.y, &update.y);
        set(&mut self.width, &update.width);
        set(&mut self.height, &update.height);
    }
}

/// Persisted window placement of the worker UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

/// Ordered key to number mapping.
///
/// A series parsed from wire text keeps that text, so an unmodified series
/// encodes back byte for byte. Any edit drops it and encoding falls back to
/// compact JSON.
#[derive(Debug, Clone, Default)]
pub struct Series {
    values: IndexMap<String, Number>,
    source: Option<String>,
}

impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Serialize for Series {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses wire text. An empty string is an empty series.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let values = if text.is_empty() {
            IndexMap::new()
        } else {
            serde_json::from_str(text)?
        };
        Ok(Self {
            values,
            source: Some(text.to_string()),
        })
    }

    /// Compact JSON object of the current values.
    pub fn to_json(&self) -> String {
        // String keys and numbers cannot fail to serialize.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "{}".into())
    }

    /// Wire text: the parsed source when unmodified, otherwise compact JSON
    /// (`""` for an empty series).
    pub fn to_wire(&self) -> String {
        match &self.source {
            Some(source) => source.clone(),
            None if self.values.is_empty() => String::new(),
            None => self.to_json(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Number>) {
        self.source = None;
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Number> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Number)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing header row")]
    MissingHeader,
    #[error("row {row}: column `{column}` is not numeric: {value:?}")]
    NotNumeric {
        row: String,
        column: String,
        value: String,
    },
    #[error("duplicate row index {0:?}")]
    DuplicateIndex(String),
}

/// Row-indexed table of numeric columns. Empty cells are kept as missing
/// values. Like [`Series`], a parsed table keeps its CSV text until edited.
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    index_name: String,
    columns: Vec<String>,
    rows: IndexMap<String, Vec<Option<Number>>>,
    source: Option<String>,
}

impl PartialEq for DataFrame {
    fn eq(&self, other: &Self) -> bool {
        self.index_name == other.index_name
            && self.columns == other.columns
            && self.rows == other.rows
    }
}

impl DataFrame {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            index_name: String::new(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: IndexMap::new(),
            source: None,
        }
    }

    /// Appends a row; missing trailing cells are padded with missing values.
    pub fn push_row(
        &mut self,
        index: impl Into<String>,
        cells: impl IntoIterator<Item = Option<Number>>,
    ) {
        let mut cells: Vec<Option<Number>> = cells.into_iter().collect();
        cells.resize(self.columns.len(), None);
        self.source = None;
        self.rows.insert(index.into(), cells);
    }

    /// Parses CSV whose first column holds the row index.
    pub fn from_csv(text: &str) -> Result<Self, FrameError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(text.as_bytes());
        let headers = reader.headers()?.clone();
        let mut header_iter = headers.iter();
        let index_name = header_iter.next().ok_or(FrameError::MissingHeader)?;
        let columns: Vec<String> = header_iter.map(str::to_string).collect();

        let mut rows = IndexMap::new();
        for record in reader.records() {
            let record = record?;
            let mut fields = record.iter();
            let index = fields.next().unwrap_or_default().to_string();
            let mut cells = Vec::with_capacity(columns.len());
            for (column, raw) in columns.iter().zip(fields) {
                if raw.is_empty() {
                    cells.push(None);
                    continue;
                }
                let value = raw.parse::<Number>().map_err(|_| FrameError::NotNumeric {
                    row: index.clone(),
                    column: column.clone(),
                    value: raw.to_string(),
                })?;
                cells.push(Some(value));
            }
            if rows.contains_key(&index) {
                return Err(FrameError::DuplicateIndex(index));
            }
            rows.insert(index, cells);
        }

        Ok(Self {
            index_name: index_name.to_string(),
            columns,
            rows,
            source: Some(text.to_string()),
        })
    }

    /// CSV text: the parsed source when unmodified, otherwise freshly written
    /// with `\n` line endings.
    pub fn to_csv(&self) -> Result<String, FrameError> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }
        self.render_csv()
    }

    fn render_csv(&self) -> Result<String, FrameError> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push(self.index_name.as_str());
        header.extend(self.columns.iter().map(String::as_str));
        writer.write_record(&header)?;
        for (index, cells) in &self.rows {
            let mut record = Vec::with_capacity(cells.len() + 1);
            record.push(index.clone());
            record.extend(
                cells
                    .iter()
                    .map(|cell| cell.as_ref().map(Number::to_string).unwrap_or_default()),
            );
            writer.write_record(&record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| FrameError::Csv(csv::Error::from(err.into_error())))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// JSON object keyed by row index, each row an object of column values.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, index: &str, column: &str) -> Option<&Number> {
        let position = self.columns.iter().position(|c| c == column)?;
        self.rows.get(index)?.get(position)?.as_ref()
    }
}

impl Serialize for DataFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Row<'a> {
            columns: &'a [String],
            cells: &'a [Option<Number>],
        }

        impl Serialize for Row<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.columns.len()))?;
                for (column, cell) in self.columns.iter().zip(self.cells) {
                    map.serialize_entry(column, cell)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(self.rows.len()))?;
        for (index, cells) in &self.rows {
            map.serialize_entry(
                index,
                &Row {
                    columns: &self.columns,
                    cells,
                },
            )?;
        }
        map.end()
    }
}

/// Canvas and frame corner tables. Only ever present as a pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Corners {
    pub canvas: DataFrame,
    pub frame: DataFrame,
}

/// Settings in the shape UI commands expect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedSettings {
    pub video_config: Option<Series>,
    pub surface_alphas: Option<Series>,
    pub corners: Option<Corners>,
    pub geometry: WindowGeometry,
}

fn decode_series(field: &'static str, value: Option<&str>) -> Result<Option<Series>, CodecError> {
    value
        .map(|text| Series::from_json(text).map_err(|err| CodecError::malformed(field, err)))
        .transpose()
}

fn decode_corners(wire: &WireSettings) -> Result<Option<Corners>, CodecError> {
    let (Some(canvas), Some(frame)) = (
        wire.canvas_corners.as_deref().filter(|v| !v.is_empty()),
        wire.frame_corners.as_deref().filter(|v| !v.is_empty()),
    ) else {
        return Ok(None);
    };
    let canvas =
        DataFrame::from_csv(canvas).map_err(|err| CodecError::malformed("canvas_corners", err))?;
    let frame =
        DataFrame::from_csv(frame).map_err(|err| CodecError::malformed("frame_corners", err))?;
    Ok(Some(Corners { canvas, frame }))
}

/// Strict wire to typed conversion: any malformed field fails the whole
/// document.
pub fn decode(wire: &WireSettings) -> Result<TypedSettings, CodecError> {
    Ok(TypedSettings {
        video_config: decode_series("video_config", wire.video_config.as_deref())?,
        surface_alphas: decode_series("surface_alphas", wire.surface_alphas.as_deref())?,
        corners: decode_corners(wire)?,
        geometry: wire.geometry(),
    })
}

/// Wire to typed conversion that logs and leaves out malformed fields.
pub fn decode_lenient(wire: &WireSettings) -> TypedSettings {
    fn keep<T>(result: Result<Option<T>, CodecError>) -> Option<T> {
        result.unwrap_or_else(|err| {
            warn!(error = %err, "skipping malformed settings field");
            None
        })
    }
    TypedSettings {
        video_config: keep(decode_series("video_config", wire.video_config.as_deref())),
        surface_alphas: keep(decode_series("surface_alphas", wire.surface_alphas.as_deref())),
        corners: keep(decode_corners(wire)),
        geometry: wire.geometry(),
    }
}

pub fn encode(typed: &TypedSettings) -> Result<WireSettings, CodecError> {
    let (canvas_corners, frame_corners) = match &typed.corners {
        Some(corners) => (
            Some(
                corners
                    .canvas
                    .to_csv()
                    .map_err(|err| CodecError::malformed("canvas_corners", err))?,
            ),
            Some(
                corners
                    .frame
                    .to_csv()
                    .map_err(|err| CodecError::malformed("frame_corners", err))?,
            ),
        ),
        None => (None, None),
    };
    Ok(WireSettings {
        video_config: typed.video_config.as_ref().map(Series::to_wire),
        surface_alphas: typed.surface_alphas.as_ref().map(Series::to_wire),
        canvas_corners,
        frame_corners,
        x: typed.geometry.x,
        y: typed.geometry.y,
        width: typed.geometry.width,
        height: typed.geometry.height,
    })
}
