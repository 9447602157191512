use super::frame::read_frame;
use super::frame::write_frame;

#[tokio::test]
async fn frame_roundtrip() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"hello").await.unwrap();
    write_frame(&mut buf, b"").await.unwrap();
    write_frame(&mut buf, &[0u8, 1, 2, 255]).await.unwrap();

    let mut reader = std::io::Cursor::new(buf);
    assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), &b"hello"[..]);
    assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), &b""[..]);
    assert_eq!(
        read_frame(&mut reader).await.unwrap().unwrap(),
        &[0u8, 1, 2, 255][..]
    );
    assert!(read_frame(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn eof_mid_frame_is_an_error() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"truncated").await.unwrap();
    buf.truncate(buf.len() - 3);

    let mut reader = std::io::Cursor::new(buf);
    assert!(read_frame(&mut reader).await.is_err());
}

#[tokio::test]
async fn oversized_length_prefix_is_rejected() {
    let buf = u32::MAX.to_be_bytes().to_vec();
    let mut reader = std::io::Cursor::new(buf);
    assert!(read_frame(&mut reader).await.is_err());
}
