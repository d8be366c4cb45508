// Boxed-container validation: box demultiplexing, metadata delivery
// through the box sink, partial codestreams, and truncation handling.

use hex_literal::hex;
use jxlstream::{
    BasicInfo, BoxType, ColorEncoding, DecodeError, Decoder, Encoder, EncoderOptions, EventMask,
    FrameHeader, ImageKind, Orientation, PixelFormat, Progress, SampleType,
};

fn gray_info(w: u32, h: u32) -> BasicInfo {
    BasicInfo {
        xsize: w,
        ysize: h,
        bits_per_sample: 8,
        exponent_bits: 0,
        num_color_channels: 1,
        alpha_premultiplied: false,
        uses_original_profile: false,
        orientation: Orientation::Identity,
        preview: None,
        animation: None,
        extra_channels: Vec::new(),
    }
}

fn gray8() -> PixelFormat {
    PixelFormat::new(1, SampleType::U8)
}

const EXIF_PAYLOAD: &[u8] = b"\x00\x00\x00\x08example exif payload";

fn container_with_exif() -> Vec<u8> {
    let mut encoder = Encoder::with_options(EncoderOptions {
        container: true,
        progressive_passes: false,
    });
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    encoder.add_box(BoxType::EXIF, EXIF_PAYLOAD).unwrap();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &[0x42; 64])
        .unwrap();
    encoder.close_frames().unwrap();
    encoder.finish().unwrap()
}

#[test]
fn container_opens_with_signature_and_ftyp() {
    let stream = container_with_exif();
    assert_eq!(
        &stream[..12],
        &hex!("0000 000c 4a58 4c20 0d0a 870a"),
        "signature box"
    );
    assert_eq!(&stream[16..20], b"ftyp");
    assert_eq!(jxlstream::sniff(&stream), jxlstream::Signature::Container);
}

#[test]
fn unattached_box_is_skipped_but_parsing_completes() {
    let stream = container_with_exif();
    let mut decoder = Decoder::new();
    decoder
        .subscribe(EventMask::BOX | EventMask::BASIC_INFO)
        .unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::Box));
    assert_eq!(decoder.box_type(false), Ok(BoxType::EXIF));
    assert_eq!(
        decoder.box_raw_size(),
        Ok(EXIF_PAYLOAD.len() as u64 + 8)
    );

    // No box buffer attached: the payload is skipped, parsing continues.
    assert_eq!(decoder.step(), Ok(Progress::BasicInfo));
    assert_eq!(decoder.step(), Ok(Progress::Complete));
}

#[test]
fn attached_box_buffer_receives_exact_payload() {
    let stream = container_with_exif();
    let mut decoder = Decoder::new();
    decoder.subscribe(EventMask::BOX).unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::Box));
    decoder
        .set_box_buffer(vec![0; EXIF_PAYLOAD.len()])
        .unwrap();
    assert_eq!(decoder.step(), Ok(Progress::Complete));

    let (buf, written) = decoder.release_box_buffer().unwrap();
    assert_eq!(written, EXIF_PAYLOAD.len());
    assert_eq!(&buf[..written], EXIF_PAYLOAD);
}

#[test]
fn small_box_buffers_are_refilled_chunk_by_chunk() {
    let stream = container_with_exif();
    let mut decoder = Decoder::new();
    decoder.subscribe(EventMask::BOX).unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::Box));
    decoder.set_box_buffer(vec![0; 5]).unwrap();

    let mut collected = Vec::new();
    loop {
        match decoder.step().unwrap() {
            Progress::NeedBoxOutput => {
                let (buf, written) = decoder.release_box_buffer().unwrap();
                collected.extend_from_slice(&buf[..written]);
                decoder.set_box_buffer(buf).unwrap();
            }
            Progress::Complete => break,
            other => panic!("unexpected progress: {other:?}"),
        }
    }
    let (buf, written) = decoder.release_box_buffer().unwrap();
    collected.extend_from_slice(&buf[..written]);
    assert_eq!(collected, EXIF_PAYLOAD);
}

#[test]
fn brob_boxes_expose_the_inner_type() {
    let mut payload = Vec::from(*b"xml ");
    payload.extend_from_slice(b"compressed-bytes-here");

    let mut encoder = Encoder::with_options(EncoderOptions {
        container: true,
        progressive_passes: false,
    });
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    encoder
        .add_box(BoxType::BROTLI_COMPRESSED, &payload)
        .unwrap();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &[1; 64])
        .unwrap();
    encoder.close_frames().unwrap();
    let stream = encoder.finish().unwrap();

    let mut decoder = Decoder::new();
    decoder.subscribe(EventMask::BOX).unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::Box));
    assert_eq!(decoder.box_type(false), Ok(BoxType::BROTLI_COMPRESSED));
    assert_eq!(decoder.box_type(true), Ok(BoxType::XML));

    // The delivered payload is the compressed blob after the inner tag.
    decoder.set_box_buffer(vec![0; 64]).unwrap();
    assert_eq!(decoder.step(), Ok(Progress::Complete));
    let (buf, written) = decoder.release_box_buffer().unwrap();
    assert_eq!(&buf[..written], b"compressed-bytes-here");
}

#[test]
fn trailing_boxes_after_the_codestream_still_complete() {
    let mut encoder = Encoder::with_options(EncoderOptions {
        container: true,
        progressive_passes: false,
    });
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &[9; 64])
        .unwrap();
    // Submitted after the first frame, so it trails the codestream.
    encoder.add_box(BoxType::XML, b"<meta/>").unwrap();
    encoder.close_frames().unwrap();
    let stream = encoder.finish().unwrap();

    let mut decoder = Decoder::new();
    decoder
        .subscribe(EventMask::FULL_IMAGE | EventMask::BOX)
        .unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::NeedImageBuffer));
    decoder
        .set_image_buffer(ImageKind::Primary, gray8(), vec![0; 64])
        .unwrap();
    assert_eq!(decoder.step(), Ok(Progress::FullImage));
    assert_eq!(decoder.step(), Ok(Progress::Box));
    assert_eq!(decoder.box_type(false), Ok(BoxType::XML));
    decoder.set_box_buffer(vec![0; 16]).unwrap();
    assert_eq!(decoder.step(), Ok(Progress::Complete));
    let (buf, written) = decoder.release_box_buffer().unwrap();
    assert_eq!(&buf[..written], b"<meta/>");
}

/// Split a bare codestream across jxlp boxes by hand.
fn partial_codestream_container(codestream: &[u8], split: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&hex!("0000 000c 4a58 4c20 0d0a 870a"));
    let mut ftyp = Vec::new();
    ftyp.extend_from_slice(b"jxl ");
    ftyp.extend_from_slice(&0u32.to_be_bytes());
    jxlstream::container::write_box_header(&mut out, BoxType::FILE_TYPE, ftyp.len() as u64);
    out.extend_from_slice(&ftyp);

    let (head, tail) = codestream.split_at(split);
    jxlstream::container::write_box_header(
        &mut out,
        BoxType::PARTIAL_CODESTREAM,
        head.len() as u64 + 4,
    );
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(head);
    jxlstream::container::write_box_header(
        &mut out,
        BoxType::PARTIAL_CODESTREAM,
        tail.len() as u64 + 4,
    );
    out.extend_from_slice(&0x8000_0001u32.to_be_bytes());
    out.extend_from_slice(tail);
    out
}

#[test]
fn partial_codestream_boxes_reassemble() {
    let mut encoder = Encoder::new();
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    let samples: Vec<u8> = (0..64u8).collect();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &samples)
        .unwrap();
    encoder.close_frames().unwrap();
    let codestream = encoder.finish().unwrap();

    let stream = partial_codestream_container(&codestream, 13);
    let mut decoder = Decoder::new();
    decoder.subscribe(EventMask::FULL_IMAGE).unwrap();
    decoder.set_input(stream).unwrap();
    decoder.close_input();

    assert_eq!(decoder.step(), Ok(Progress::NeedImageBuffer));
    decoder
        .set_image_buffer(ImageKind::Primary, gray8(), vec![0; 64])
        .unwrap();
    assert_eq!(decoder.step(), Ok(Progress::FullImage));
    assert_eq!(
        decoder.release_image_buffer(ImageKind::Primary).unwrap(),
        samples
    );
    assert_eq!(decoder.step(), Ok(Progress::Complete));
}

#[test]
fn out_of_order_partial_codestream_is_an_error() {
    let mut encoder = Encoder::new();
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &[0; 64])
        .unwrap();
    encoder.close_frames().unwrap();
    let codestream = encoder.finish().unwrap();

    let mut stream = partial_codestream_container(&codestream, 13);
    // Corrupt the first jxlp index: signature box (12) + ftyp box (16) +
    // jxlp header (8) puts it at offset 36.
    stream[36..40].copy_from_slice(&5u32.to_be_bytes());

    let mut decoder = Decoder::new();
    decoder.set_input(stream).unwrap();
    assert_eq!(decoder.step(), Err(DecodeError::InvalidPartialCodestream));
    assert_eq!(decoder.step(), Err(DecodeError::Failed));
}

#[test]
fn truncated_box_is_detected_once_input_closes() {
    let mut stream = container_with_exif();
    // Drop the last 10 bytes of the stream.
    stream.truncate(stream.len() - 10);

    let mut decoder = Decoder::new();
    decoder.set_input(stream).unwrap();
    assert_eq!(decoder.step(), Ok(Progress::NeedMoreInput));

    // The decoder cannot distinguish a stall from truncation until the
    // caller closes the input.
    decoder.close_input();
    assert_eq!(decoder.step(), Err(DecodeError::TruncatedStream));
}

#[test]
fn jpeg_reconstruction_data_precedes_the_image() {
    const JBRD: &[u8] = b"reconstruction-tables";

    let mut encoder = Encoder::with_options(EncoderOptions {
        container: true,
        progressive_passes: false,
    });
    encoder.set_basic_info(gray_info(8, 8)).unwrap();
    encoder.set_color_encoding(ColorEncoding::srgb()).unwrap();
    encoder
        .add_box(BoxType::JPEG_RECONSTRUCTION, JBRD)
        .unwrap();
    encoder
        .add_frame(FrameHeader::full_canvas(true), &[3; 64])
        .unwrap();
    encoder.close_frames().unwrap();
    let stream = encoder.finish().unwrap();

    let mut decoder = Decoder::new();
    decoder
        .subscribe(EventMask::JPEG_RECONSTRUCTION | EventMask::FULL_IMAGE)
        .unwrap();
    decoder.set_input(stream).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::JpegReconstruction));
    assert_eq!(decoder.box_type(false), Ok(BoxType::JPEG_RECONSTRUCTION));
    decoder.set_jpeg_buffer(vec![0; 64]).unwrap();

    assert_eq!(decoder.step(), Ok(Progress::NeedImageBuffer));
    decoder
        .set_image_buffer(ImageKind::Primary, gray8(), vec![0; 64])
        .unwrap();
    assert_eq!(decoder.step(), Ok(Progress::FullImage));
    assert_eq!(decoder.step(), Ok(Progress::Complete));

    let (buf, written) = decoder.release_jpeg_buffer().unwrap();
    assert_eq!(&buf[..written], JBRD);
}

#[test]
fn missing_codestream_is_reported_at_close() {
    // Signature and ftyp boxes only.
    let mut stream = Vec::new();
    stream.extend_from_slice(&hex!("0000 000c 4a58 4c20 0d0a 870a"));
    let mut ftyp = Vec::new();
    ftyp.extend_from_slice(b"jxl ");
    ftyp.extend_from_slice(&0u32.to_be_bytes());
    jxlstream::container::write_box_header(&mut stream, BoxType::FILE_TYPE, ftyp.len() as u64);
    stream.extend_from_slice(&ftyp);

    let mut decoder = Decoder::new();
    decoder.set_input(stream).unwrap();
    assert_eq!(decoder.step(), Ok(Progress::NeedMoreInput));
    decoder.close_input();
    assert_eq!(decoder.step(), Err(DecodeError::MissingCodestream));
}
