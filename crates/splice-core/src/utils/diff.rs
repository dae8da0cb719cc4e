use std::io;

pub fn apply_diff(orig: &[u8], diff: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    bsdiff::patch(orig, &mut diff.as_ref(), &mut output)?;
    Ok(output)
}

#[cfg(test)]
pub fn create_diff(old: &[u8], new: &[u8]) -> io::Result<Vec<u8>> {
    let mut diff = Vec::new();
    bsdiff::diff(old, new, &mut diff)?;
    Ok(diff)
}
