use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GrayImage, ImageOutputFormat, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, io::Cursor, str::FromStr};

use crate::error::ClientError;

const JPEG_QUALITY: u8 = 90;

/// Encoding used to ship an image to the inference service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Lowercase name, as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
        }
    }

    fn output_format(self) -> ImageOutputFormat {
        match self {
            ImageFormat::Jpeg => ImageOutputFormat::Jpeg(JPEG_QUALITY),
            ImageFormat::Png => ImageOutputFormat::Png,
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            _ => Err(ClientError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory layout of a raw pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb8,
    Rgba8,
    Luma8,
}

impl PixelLayout {
    /// Bytes per pixel.
    pub fn channels(&self) -> usize {
        match self {
            PixelLayout::Rgb8 => 3,
            PixelLayout::Rgba8 => 4,
            PixelLayout::Luma8 => 1,
        }
    }
}

/// A borrowed, row-major pixel buffer.
///
/// The image must already have the dimensions the model expects; queries never
/// resize or crop.
#[derive(Clone, Copy, Debug)]
pub struct RawImage<'a> {
    /// `width * height * layout.channels()` bytes.
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl<'a> RawImage<'a> {
    pub fn new(pixels: &'a [u8], width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            pixels,
            width,
            height,
            layout,
        }
    }

    /// Shorthand for an 8-bit RGB buffer.
    pub fn rgb(pixels: &'a [u8], width: u32, height: u32) -> Self {
        Self::new(pixels, width, height, PixelLayout::Rgb8)
    }

    fn to_dynamic(self) -> Result<DynamicImage, ClientError> {
        let buffer = self.pixels.to_vec();
        let image = match self.layout {
            PixelLayout::Rgb8 => {
                RgbImage::from_raw(self.width, self.height, buffer).map(DynamicImage::ImageRgb8)
            }
            PixelLayout::Rgba8 => {
                RgbaImage::from_raw(self.width, self.height, buffer).map(DynamicImage::ImageRgba8)
            }
            PixelLayout::Luma8 => {
                GrayImage::from_raw(self.width, self.height, buffer).map(DynamicImage::ImageLuma8)
            }
        };
        image.ok_or_else(|| ClientError::PixelBuffer {
            width: self.width,
            height: self.height,
            layout: self.layout,
            expected: self.width as usize * self.height as usize * self.layout.channels(),
            actual: self.pixels.len(),
        })
    }
}

/// The three shapes of a query.
#[derive(Clone, Copy, Debug)]
pub enum QueryInput<'a> {
    /// An image encoded with the backend's [`QueryDefaults`].
    Image(RawImage<'a>),
    /// An image encoded as `format` and stored under `key`.
    ImageWithEncoding {
        image: RawImage<'a>,
        format: ImageFormat,
        key: &'a str,
    },
    /// A pre-built payload, sent as-is.
    RawPayload(&'a Value),
}

/// Encoding and payload key used by single-argument image queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefaults {
    /// Encoding for the image.
    pub format: ImageFormat,
    /// Payload key holding the base64-encoded image.
    pub key: String,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            key: "image".to_string(),
        }
    }
}

/// Encodes a raw image as JPEG or PNG.
///
/// JPEG has no alpha channel, so RGBA input is flattened to RGB first.
pub fn encode_image(image: &RawImage<'_>, format: ImageFormat) -> Result<Vec<u8>, ClientError> {
    let mut dynamic = image.to_dynamic()?;
    if format == ImageFormat::Jpeg && image.layout == PixelLayout::Rgba8 {
        dynamic = DynamicImage::ImageRgb8(dynamic.to_rgb8());
    }

    let mut buffer = Cursor::new(Vec::new());
    dynamic.write_to(&mut buffer, format.output_format())?;
    Ok(buffer.into_inner())
}

/// Stores the base64-encoded image under `key`, leaving the other keys untouched.
pub fn insert_image(
    payload: &mut Map<String, Value>,
    image: &RawImage<'_>,
    format: ImageFormat,
    key: &str,
) -> Result<(), ClientError> {
    let encoded = STANDARD.encode(encode_image(image, format)?);
    payload.insert(key.to_string(), Value::String(encoded));
    Ok(())
}

/// Builds a fresh payload holding only the encoded image.
pub fn image_payload(
    image: &RawImage<'_>,
    format: ImageFormat,
    key: &str,
) -> Result<Value, ClientError> {
    let mut payload = Map::new();
    insert_image(&mut payload, image, format, key)?;
    Ok(Value::Object(payload))
}

/// The query contract every transport backend implements.
///
/// Queries are fire-and-forget: results, and any failure to send, arrive later as
/// events delivered through the backend's [`crate::DispatchBridge`].
pub trait InferenceBackend {
    /// Sends an image using the backend's configured [`QueryDefaults`].
    fn query_image(&self, image: &RawImage<'_>);

    /// Sends an image encoded as `format` under the payload key `key`.
    fn query_image_as(&self, image: &RawImage<'_>, format: ImageFormat, key: &str);

    /// Sends a caller-built payload without further encoding.
    fn query_json(&self, payload: &Value);

    /// Routes a [`QueryInput`] to the matching operation.
    fn query(&self, input: QueryInput<'_>) {
        match input {
            QueryInput::Image(image) => self.query_image(&image),
            QueryInput::ImageWithEncoding { image, format, key } => {
                self.query_image_as(&image, format, key)
            }
            QueryInput::RawPayload(payload) => self.query_json(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{cell::RefCell, sync::LazyLock};

    const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

    static PIXELS: LazyLock<Vec<u8>> =
        LazyLock::new(|| (0..4 * 3 * 3).map(|i| (i * 7 % 256) as u8).collect());

    fn sample() -> RawImage<'static> {
        RawImage::rgb(&PIXELS, 4, 3)
    }

    fn decode(value: &Value) -> Vec<u8> {
        STANDARD.decode(value.as_str().unwrap()).unwrap()
    }

    #[test]
    fn png_lands_under_requested_key() {
        let mut payload = Map::new();
        payload.insert("threshold".to_string(), json!(0.5));

        insert_image(&mut payload, &sample(), ImageFormat::Png, "img").unwrap();

        assert_eq!(payload["threshold"], json!(0.5));
        let bytes = decode(&payload["img"]);
        assert!(bytes.starts_with(PNG_SIGNATURE));

        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.as_raw(), &*PIXELS);
    }

    #[test]
    fn jpeg_payload_has_single_key() {
        let payload = image_payload(&sample(), ImageFormat::Jpeg, "image").unwrap();
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(decode(&object["image"]).starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn rgba_is_flattened_for_jpeg() {
        let pixels = vec![200u8; 2 * 2 * 4];
        let image = RawImage::new(&pixels, 2, 2, PixelLayout::Rgba8);
        let bytes = encode_image(&image, ImageFormat::Jpeg).unwrap();
        assert!(bytes.starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let pixels = vec![0u8; 10];
        let err = encode_image(&RawImage::rgb(&pixels, 4, 3), ImageFormat::Png).unwrap_err();
        assert!(matches!(
            err,
            ClientError::PixelBuffer {
                expected: 36,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("PNG".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert_eq!("jpg".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("JPEG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert!(matches!(
            "gif".parse::<ImageFormat>(),
            Err(ClientError::UnsupportedFormat(_))
        ));
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
    }

    impl InferenceBackend for Recorder {
        fn query_image(&self, _image: &RawImage<'_>) {
            self.calls.borrow_mut().push("image".to_string());
        }

        fn query_image_as(&self, _image: &RawImage<'_>, format: ImageFormat, key: &str) {
            self.calls.borrow_mut().push(format!("{format}:{key}"));
        }

        fn query_json(&self, payload: &Value) {
            self.calls.borrow_mut().push(payload.to_string());
        }
    }

    #[test]
    fn query_routes_each_input_shape() {
        let backend = Recorder::default();
        let payload = json!({"caption": "a cat"});

        backend.query(QueryInput::Image(sample()));
        backend.query(QueryInput::ImageWithEncoding {
            image: sample(),
            format: ImageFormat::Png,
            key: "img",
        });
        backend.query(QueryInput::RawPayload(&payload));

        assert_eq!(
            *backend.calls.borrow(),
            vec!["image", "png:img", r#"{"caption":"a cat"}"#]
        );
    }
}
